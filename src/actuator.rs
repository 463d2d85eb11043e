//! Actuator control through InputOutputControlByIdentifier (0x2F)
//!
//! USE WITH CAUTION! Actuations move real components.
//!
//! [ActuatorController] tracks which actuators are under tester control and makes sure
//! control is handed back to the ECU (ReturnControlToEcu) once a command is abandoned
//! (No response, rejected, cancelled) or finished with ([ActuatorController::release],
//! the end of [ActuatorController::run_timed], or dropping the controller).

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use automotive_diag::uds::UdsCommand;
use log::{debug, warn};

use crate::{
    channel::PayloadChannel,
    uds::{UdsDiagnosticServer, UdsRequest, UdsResponse},
    DiagError, DiagServerResult,
};

pub use automotive_diag::uds::InputOutputControlParameter;

/// How often a hold period checks for cancellation
const HOLD_POLL: Duration = Duration::from_millis(10);

/// Attempts at handing an actuator back when the request keeps getting interrupted
const RETURN_CONTROL_ATTEMPTS: usize = 3;
const RETURN_CONTROL_RETRY: Duration = Duration::from_millis(10);

/// Actuator controller options
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ActuatorOptions {
    /// How long the ECU has to confirm a control command
    pub response_deadline_ms: u32,
}

impl Default for ActuatorOptions {
    fn default() -> Self {
        Self {
            response_deadline_ms: 1000,
        }
    }
}

/// A control command for one actuator
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ActuatorCommand {
    /// Data identifier of the actuator
    pub id: u16,
    /// What to do
    pub control: InputOutputControlParameter,
    /// Control option record (For example the target value of an adjustment)
    pub options: Vec<u8>,
}

impl ActuatorCommand {
    /// Drive actuator `id` to `value`
    pub fn short_term_adjustment(id: u16, value: &[u8]) -> Self {
        Self {
            id,
            control: InputOutputControlParameter::ShortTermAdjustment,
            options: value.to_vec(),
        }
    }

    /// Freeze actuator `id` in its current state
    pub fn freeze_current_state(id: u16) -> Self {
        Self {
            id,
            control: InputOutputControlParameter::FreezeCurrentState,
            options: Vec::new(),
        }
    }

    /// Hand actuator `id` back to the ECU
    pub fn return_control_to_ecu(id: u16) -> Self {
        Self {
            id,
            control: InputOutputControlParameter::ReturnControlToEcu,
            options: Vec::new(),
        }
    }

    fn to_request(&self) -> UdsRequest {
        let mut params = self.id.to_be_bytes().to_vec();
        params.push(self.control.into());
        params.extend_from_slice(&self.options);
        UdsRequest::new(UdsCommand::InputOutputControlByIdentifier, None, &params)
    }
}

/// State of an actuator command
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display, serde::Serialize)]
pub enum ActuatorOutcome {
    /// Sent, waiting for the ECU
    Pending,
    /// ECU accepted the command
    Confirmed,
    /// ECU did not answer in time. Control was handed back to the ECU
    TimedOut,
    /// ECU refused the command with the negative response code
    Rejected(u8),
}

/// Removes an actuator from the pending set when dropped
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<u16>>,
    id: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs actuator commands on an ECU
pub struct ActuatorController<P: PayloadChannel> {
    server: Arc<UdsDiagnosticServer<P>>,
    options: ActuatorOptions,
    /// Commands waiting for the ECU
    pending: Mutex<HashSet<u16>>,
    /// Confirmed commands, the actuator stays under tester control until released
    latched: Mutex<HashSet<u16>>,
    /// Serializes this controller's requests so different actuators queue up
    /// instead of hitting [DiagError::RequestInFlight]
    send_lock: Mutex<()>,
    /// True while the request on the server is one of this controller's control
    /// commands (Never a ReturnControlToEcu)
    command_in_flight: Mutex<bool>,
    cancelled: AtomicBool,
}

impl<P: PayloadChannel> std::fmt::Debug for ActuatorController<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorController")
            .field("options", &self.options)
            .field("pending", &*lock(&self.pending))
            .field("latched", &*lock(&self.latched))
            .finish()
    }
}

impl<P: PayloadChannel> ActuatorController<P> {
    /// Creates a controller sending through `server`
    pub fn new(server: Arc<UdsDiagnosticServer<P>>, options: ActuatorOptions) -> Self {
        Self {
            server,
            options,
            pending: Mutex::new(HashSet::new()),
            latched: Mutex::new(HashSet::new()),
            send_lock: Mutex::new(()),
            command_in_flight: Mutex::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Current state of an actuator. [ActuatorOutcome::Pending] while a command is
    /// waiting for the ECU, [ActuatorOutcome::Confirmed] while under tester control,
    /// [None] if the ECU controls it
    pub fn state(&self, id: u16) -> Option<ActuatorOutcome> {
        if lock(&self.pending).contains(&id) {
            Some(ActuatorOutcome::Pending)
        } else if lock(&self.latched).contains(&id) {
            Some(ActuatorOutcome::Confirmed)
        } else {
            None
        }
    }

    /// Sends one command and waits for the ECU to confirm it.
    ///
    /// A confirmed command leaves the actuator under tester control until
    /// [ActuatorController::release]. New commands for an actuator under tester
    /// control are sent as usual. If the ECU rejects or does not answer, control is
    /// handed back straight away.
    ///
    /// Fails with [DiagError::ActuatorBusy] while another command for the same
    /// actuator is waiting for the ECU
    pub fn execute(&self, cmd: &ActuatorCommand) -> DiagServerResult<ActuatorOutcome> {
        self.cancelled.store(false, Ordering::Release);
        self.execute_inner(cmd)
    }

    /// Hands an actuator back to the ECU
    pub fn release(&self, id: u16) -> DiagServerResult<()> {
        if lock(&self.pending).contains(&id) {
            return Err(DiagError::ActuatorBusy(id));
        }
        lock(&self.latched).remove(&id);
        self.return_control(id)
    }

    /// Runs a command, holds it for `hold` and hands control back to the ECU.
    ///
    /// Returns the outcome of the command. Control is returned to the ECU whatever
    /// the outcome
    pub fn run_timed(
        &self,
        cmd: &ActuatorCommand,
        hold: Duration,
    ) -> DiagServerResult<ActuatorOutcome> {
        self.cancelled.store(false, Ordering::Release);
        self.run_timed_inner(cmd, hold)
    }

    /// Runs commands one after the other, each held for `hold` (See
    /// [ActuatorController::run_timed]). A rejected or timed out actuator does not stop
    /// the sequence.
    ///
    /// ## Returns
    /// The outcome of each command, by actuator ID
    pub fn run_sequence(
        &self,
        cmds: &[ActuatorCommand],
        hold: Duration,
    ) -> DiagServerResult<Vec<(u16, ActuatorOutcome)>> {
        self.cancelled.store(false, Ordering::Release);
        let mut res = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let outcome = self.run_timed_inner(cmd, hold)?;
            debug!("Actuator 0x{:04X}: {outcome}", cmd.id);
            res.push((cmd.id, outcome));
        }
        Ok(res)
    }

    /// Abandons whatever the controller is running. The running call returns
    /// [DiagError::Cancelled], and every actuator under tester control is handed
    /// back to the ECU.
    ///
    /// Only interrupts the server's in-flight request if it is a control command of
    /// this controller. ReturnControlToEcu requests and requests of other users of the
    /// server are left alone.
    ///
    /// Returns true if a control command was waiting for the ECU
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        let interrupted = {
            let in_flight = lock(&self.command_in_flight);
            *in_flight && self.server.cancel_request()
        };
        debug!("Actuator controller cancelled");
        self.release_all();
        interrupted
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn execute_inner(&self, cmd: &ActuatorCommand) -> DiagServerResult<ActuatorOutcome> {
        if cmd.control == InputOutputControlParameter::ReturnControlToEcu {
            self.release(cmd.id)?;
            return Ok(ActuatorOutcome::Confirmed);
        }
        if self.is_cancelled() {
            return Err(DiagError::Cancelled);
        }
        let _pending = {
            let mut pending = lock(&self.pending);
            if !pending.insert(cmd.id) {
                return Err(DiagError::ActuatorBusy(cmd.id));
            }
            PendingGuard {
                pending: &self.pending,
                id: cmd.id,
            }
        };
        debug!("Actuator 0x{:04X}: {:?} {:02X?}", cmd.id, cmd.control, cmd.options);
        let res = {
            let _send = lock(&self.send_lock);
            *lock(&self.command_in_flight) = true;
            let res = self.server.request_with_timeout(&cmd.to_request(), self.deadline());
            *lock(&self.command_in_flight) = false;
            res
        };
        match res {
            Ok(UdsResponse::Positive { .. }) if self.is_cancelled() => {
                // Cancelled after the ECU confirmed, hand it straight back
                self.abandon(cmd.id);
                Err(DiagError::Cancelled)
            }
            Ok(UdsResponse::Positive { .. }) => {
                lock(&self.latched).insert(cmd.id);
                Ok(ActuatorOutcome::Confirmed)
            }
            Ok(UdsResponse::Negative { nrc, .. }) => {
                warn!(
                    "Actuator 0x{:04X} rejected: {}",
                    cmd.id,
                    self.server.nrc_table().describe(nrc)
                );
                self.abandon(cmd.id);
                Ok(ActuatorOutcome::Rejected(nrc))
            }
            Err(DiagError::ResponseTimeout) => {
                warn!("Actuator 0x{:04X} not confirmed in time", cmd.id);
                self.abandon(cmd.id);
                Ok(ActuatorOutcome::TimedOut)
            }
            Err(e) => {
                self.abandon(cmd.id);
                Err(e)
            }
        }
    }

    fn run_timed_inner(
        &self,
        cmd: &ActuatorCommand,
        hold: Duration,
    ) -> DiagServerResult<ActuatorOutcome> {
        let outcome = self.execute_inner(cmd)?;
        if outcome != ActuatorOutcome::Confirmed
            || cmd.control == InputOutputControlParameter::ReturnControlToEcu
        {
            return Ok(outcome);
        }
        let end = Instant::now() + hold;
        loop {
            if self.is_cancelled() {
                self.abandon(cmd.id);
                return Err(DiagError::Cancelled);
            }
            let now = Instant::now();
            if now >= end {
                break;
            }
            std::thread::sleep(HOLD_POLL.min(end - now));
        }
        lock(&self.latched).remove(&cmd.id);
        self.return_control(cmd.id)?;
        Ok(outcome)
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.options.response_deadline_ms as u64)
    }

    /// Sends ReturnControlToEcu. Sent again if the request was cancelled or the
    /// server was busy with another user's request
    fn return_control(&self, id: u16) -> DiagServerResult<()> {
        debug!("Returning control of actuator 0x{id:04X} to the ECU");
        let req = ActuatorCommand::return_control_to_ecu(id).to_request();
        let _send = lock(&self.send_lock);
        let mut attempt = 1;
        loop {
            match self.server.send_command_with_timeout(req.clone(), self.deadline()) {
                Err(e @ (DiagError::Cancelled | DiagError::RequestInFlight))
                    if attempt < RETURN_CONTROL_ATTEMPTS =>
                {
                    warn!("Return of actuator 0x{id:04X} interrupted ({e}), sending again");
                    attempt += 1;
                    std::thread::sleep(RETURN_CONTROL_RETRY);
                }
                res => return res.map(|_| ()),
            }
        }
    }

    /// Best effort return of control, errors are only logged
    fn abandon(&self, id: u16) {
        lock(&self.latched).remove(&id);
        if let Err(e) = self.return_control(id) {
            warn!("Could not return control of actuator 0x{id:04X} to the ECU: {e}");
        }
    }

    fn release_all(&self) {
        let ids: Vec<u16> = lock(&self.latched).drain().collect();
        for id in ids {
            if let Err(e) = self.return_control(id) {
                warn!("Could not return control of actuator 0x{id:04X} to the ECU: {e}");
            }
        }
    }
}

impl<P: PayloadChannel> Drop for ActuatorController<P> {
    fn drop(&mut self) {
        self.release_all();
    }
}
