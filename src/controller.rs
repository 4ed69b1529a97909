//! Drive a device through a complete write
//!
//! The [SessionController] owns the [Connection] behind a mutex and runs the
//! sequence connect, identify, stub upload, baud change, flash parameters,
//! write and baud revert, reporting every step as an [Event]. Writes can run
//! on a worker thread with [SessionController::spawn_write]; a
//! [LivenessMonitor] polls an idle session to notice unplugged devices.

use std::{
    error::Error as _,
    panic,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        TryLockError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

pub use crate::flasher::CancelToken;
use crate::{
    config::SessionConfig,
    connection::{Connection, LinkStatus, Personality, SessionState, ROM_BAUD},
    error::{ConfigError, Error, ProtocolError},
    events::{Event, EventSink},
    flasher::{
        check_fits,
        stubs::FlashStub,
        DeviceIdentity,
        FlashSettings,
        Flasher,
        WriteOutcome,
    },
    transport::Transport,
};

/// Coordinates all work with one device
#[derive(Clone)]
pub struct SessionController {
    connection: Arc<Mutex<Connection>>,
    identity: Arc<Mutex<Option<DeviceIdentity>>>,
    writing: Arc<AtomicBool>,
}

/// Clears the write-in-progress flag when dropped
struct WritingGuard(Arc<AtomicBool>);

impl Drop for WritingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionController {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        SessionController {
            connection: Arc::new(Mutex::new(Connection::new(transport))),
            identity: Arc::new(Mutex::new(None)),
            writing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_identity(&self, identity: Option<DeviceIdentity>) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = identity;
    }

    /// Identity of the connected device, if any
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    /// Whether a write is in progress
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }

    fn begin_write(&self) -> Result<WritingGuard, Error> {
        if self.writing.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::InvalidState("a write is already in progress").into());
        }

        Ok(WritingGuard(self.writing.clone()))
    }

    /// Connect to the device and identify it
    pub fn connect(&self, events: &mut dyn EventSink) -> Result<DeviceIdentity, Error> {
        let mut connection = self.lock();
        self.connect_locked(&mut connection, events)
    }

    fn connect_locked(
        &self,
        connection: &mut Connection,
        events: &mut dyn EventSink,
    ) -> Result<DeviceIdentity, Error> {
        self.set_identity(None);
        events.emit(Event::Connecting {
            port: connection.port_name(),
        });

        match connection.begin().and_then(|_| connection.identify()) {
            Ok(identity) => {
                info!("Connected to {}", identity.description);
                self.set_identity(Some(identity.clone()));
                events.emit(Event::Connected(identity.clone()));

                Ok(identity)
            }
            Err(err) => {
                events.emit(Event::ConnectFailed {
                    reason: describe(&err),
                });

                Err(err)
            }
        }
    }

    /// Run a write on the calling thread
    pub fn write(
        &self,
        config: &SessionConfig,
        cancel: &CancelToken,
        events: &mut dyn EventSink,
    ) -> Result<WriteOutcome, Error> {
        let _guard = self.begin_write()?;
        self.run_write(config, cancel, events)
    }

    /// Run a write on a worker thread
    ///
    /// Events are delivered through the returned handle, which can also
    /// cancel the write.
    pub fn spawn_write(&self, config: SessionConfig) -> Result<WriteHandle, Error> {
        let guard = self.begin_write()?;

        let cancel = CancelToken::new();
        let (sender, receiver) = mpsc::channel();

        let controller = self.clone();
        let token = cancel.clone();
        let join = thread::Builder::new()
            .name("flashwriter-write".into())
            .spawn(move || {
                let _guard = guard;
                let mut events = sender;
                controller.run_write(&config, &token, &mut events)
            })?;

        Ok(WriteHandle {
            cancel,
            events: receiver,
            join,
        })
    }

    fn run_write(
        &self,
        config: &SessionConfig,
        cancel: &CancelToken,
        events: &mut dyn EventSink,
    ) -> Result<WriteOutcome, Error> {
        let mut connection = self.lock();

        let result = self.write_locked(&mut connection, config, cancel, events);

        match &result {
            Ok(WriteOutcome::Completed { .. }) => events.emit(Event::Done),
            Ok(WriteOutcome::Cancelled { completed, total }) => events.emit(Event::Cancelled {
                completed: *completed,
                total: *total,
            }),
            Err(err) => {
                // Nothing was sent for these, the session is still usable
                if !matches!(err, Error::Config(_) | Error::FlashOverflow { .. }) {
                    connection.fail();
                }
                events.emit(Event::Failed(describe(err)));
            }
        }

        result
    }

    fn write_locked(
        &self,
        connection: &mut Connection,
        config: &SessionConfig,
        cancel: &CancelToken,
        events: &mut dyn EventSink,
    ) -> Result<WriteOutcome, Error> {
        // A given flash size is checked before the device is touched
        if let Some(flash_size) = config.flash.size {
            check_fits(&config.images, flash_size)?;
        }

        let identity = match (connection.is_synced(), self.identity()) {
            (true, Some(identity)) => identity,
            _ => self.connect_locked(connection, events)?,
        };

        let flash_size = config.flash.size.unwrap_or(identity.flash_size);
        let flash_bytes = flash_size.bytes().ok_or(ConfigError::UnknownFlashSize)?;
        if config.flash.size.is_none() {
            check_fits(&config.images, flash_size)?;
        }

        if connection.personality() == Some(Personality::Rom) {
            match &config.stub {
                Some(stub) => {
                    connection.run_stub(stub)?;
                    events.emit(Event::StubLoaded);
                }
                None => events.emit(Event::Warning(
                    "No flasher stub configured, writing through the ROM loader".into(),
                )),
            }
        }

        if config.baud != connection.baud() {
            match connection.change_baud(config.baud) {
                Ok(()) => events.emit(Event::BaudChanged { baud: config.baud }),
                Err(Error::UnsupportedOperation { .. }) => events.emit(Event::Warning(format!(
                    "The device rejected {} baud, staying at {}",
                    config.baud,
                    connection.baud()
                ))),
                Err(err) => return Err(err),
            }
        }

        connection.spi_set_params(flash_bytes)?;

        let compress = config
            .compress
            .resolve(connection.personality() == Some(Personality::Stub));
        debug!("Compression {}", if compress { "on" } else { "off" });

        let settings = FlashSettings::new(config.flash.mode, Some(flash_size), config.flash.freq);

        let outcome = {
            let mut flasher =
                Flasher::new(connection, flash_size, settings, compress, cancel.clone());
            flasher.set_erase_all(config.erase_all);
            flasher.set_verify(config.verify);

            flasher.write_bins_to_flash(&config.images, events)?
        };

        revert_baud(connection, events);

        Ok(outcome)
    }

    /// Erase the whole flash, uploading the stub first if needed
    pub fn erase_flash(
        &self,
        stub: Option<&FlashStub>,
        events: &mut dyn EventSink,
    ) -> Result<(), Error> {
        let _guard = self.begin_write()?;
        let mut connection = self.lock();

        if !connection.is_synced() || self.identity().is_none() {
            self.connect_locked(&mut connection, events)?;
        }

        if connection.personality() == Some(Personality::Rom) {
            let stub = stub.ok_or(Error::StubRequired)?;
            connection.run_stub(stub)?;
            events.emit(Event::StubLoaded);
        }

        events.emit(Event::Erasing);
        match connection.erase_flash() {
            Ok(()) => {
                events.emit(Event::Done);
                Ok(())
            }
            Err(err) => {
                connection.fail();
                events.emit(Event::Failed(describe(&err)));
                Err(err)
            }
        }
    }

    /// Reset the device into its application; it has to be connected again
    /// afterwards
    pub fn hard_reset(&self) -> Result<(), Error> {
        let mut connection = self.lock();
        connection.hard_reset()?;
        self.set_identity(None);

        Ok(())
    }

    /// Close the transport and forget the device
    pub fn disconnect(&self, events: &mut dyn EventSink) {
        self.lock().disconnect();
        self.set_identity(None);
        events.emit(Event::Disconnected);
    }
}

/// Go back to the ROM baud rate, so the next connect starts from a known rate
fn revert_baud(connection: &mut Connection, events: &mut dyn EventSink) {
    if connection.baud() == ROM_BAUD {
        return;
    }

    match connection.change_baud(ROM_BAUD) {
        Ok(()) => events.emit(Event::BaudChanged { baud: ROM_BAUD }),
        Err(err) => {
            warn!("Failed to revert the baud rate: {}", err);
            events.emit(Event::Warning(format!(
                "Could not revert the baud rate to {ROM_BAUD}"
            )));
        }
    }
}

/// An error and all of its sources on one line
fn describe(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

/// A write running on a worker thread
pub struct WriteHandle {
    cancel: CancelToken,
    events: Receiver<Event>,
    join: JoinHandle<Result<WriteOutcome, Error>>,
}

impl WriteHandle {
    /// Ask the write to stop; it finishes the block in flight first
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling this write, e.g. for a signal handler
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Events of the write, in order; the channel closes when it ends
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Wait for the write to end
    pub fn wait(self) -> Result<WriteOutcome, Error> {
        match self.join.join() {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// Periodically checks that an idle device still answers
pub struct LivenessMonitor {
    controller: SessionController,
}

impl LivenessMonitor {
    pub fn new(controller: SessionController) -> Self {
        LivenessMonitor { controller }
    }

    /// Check the device once
    ///
    /// Nothing is sent while a write is in progress or the session is not
    /// synced.
    pub fn tick(&self, events: &mut dyn EventSink) -> LinkStatus {
        if self.controller.is_writing() {
            return LinkStatus::Connected;
        }

        let mut connection = match self.controller.connection.try_lock() {
            Ok(connection) => connection,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return LinkStatus::Connected,
        };

        if !connection.is_synced() {
            return connection.state().link();
        }

        match connection.check_alive() {
            Ok(()) => LinkStatus::Connected,
            Err(err) => {
                debug!("Device stopped answering: {}", err);
                self.controller.set_identity(None);
                events.emit(Event::Disconnected);

                LinkStatus::Disconnected
            }
        }
    }

    /// Tick every `interval` on a background thread until stopped
    pub fn spawn(self, interval: Duration, events: Sender<Event>) -> Result<MonitorHandle, Error> {
        let stop = CancelToken::new();
        let stopped = stop.clone();

        let join = thread::Builder::new()
            .name("flashwriter-liveness".into())
            .spawn(move || {
                let mut events = events;
                while !stopped.is_cancelled() {
                    self.tick(&mut events);
                    thread::park_timeout(interval);
                }
            })?;

        Ok(MonitorHandle { stop, join })
    }
}

/// A running [LivenessMonitor]
pub struct MonitorHandle {
    stop: CancelToken,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.stop.cancel();
        self.join.thread().unpark();
        if let Err(payload) = self.join.join() {
            panic::resume_unwind(payload);
        }
    }
}
