//! Per-actuator control panel
//!
//! Owns everything the panel knows about one RMD instance and turns user
//! intents and bus replies into bus messages. Time is passed in explicitly
//! so the guard can be driven without a running event loop.

use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Reply};
use crate::rmd::{
    self, decode_pid, encode_pid, fields, FirmwareProfile, MotionCommand, MotionGuard,
    MotionReply, MotionWord, PidParameters, SUBSYSTEM,
};
use crate::state::{ConnectionState, RunState, Telemetry};

pub struct RmdPanel<B: Bus> {
    bus: B,
    instance: u8,
    profile: FirmwareProfile,
    connection: ConnectionState,
    run_state: RunState,
    /// Gains last read from or written to the device
    pid_cache: Option<PidParameters>,
    guard: MotionGuard,
    telemetry: Telemetry,
    visible: bool,
    last_link_report: Option<Instant>,
    enable_baudrate_write: bool,
}

impl<B: Bus> RmdPanel<B> {
    pub fn new(bus: B, instance: u8, profile: FirmwareProfile) -> Self {
        let guard = MotionGuard::new(profile.guard_timeout());
        Self {
            bus,
            instance,
            profile,
            connection: ConnectionState::Disconnected,
            run_state: RunState::Stopped,
            pid_cache: None,
            guard,
            telemetry: Telemetry::new(),
            visible: false,
            last_link_report: None,
            enable_baudrate_write: false,
        }
    }

    /// Allow `set_rmd_baudrate` to reach the device
    pub fn with_baudrate_write(mut self, enable: bool) -> Self {
        self.enable_baudrate_write = enable;
        self
    }

    pub fn instance(&self) -> u8 {
        self.instance
    }

    pub fn profile(&self) -> &FirmwareProfile {
        &self.profile
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn pid_cache(&self) -> Option<PidParameters> {
        self.pid_cache
    }

    pub fn guard(&self) -> &MotionGuard {
        &self.guard
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    // ------------------------------------------------------------------
    // Visibility and polling
    // ------------------------------------------------------------------

    /// Panel became visible: request the static fields
    pub fn show(&mut self) -> Result<()> {
        self.visible = true;
        self.bus.send_commands(SUBSYSTEM, &rmd::INIT_FIELDS, self.instance)
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    /// Request every polled status field
    pub fn poll(&mut self) -> Result<()> {
        self.bus.send_commands(SUBSYSTEM, &rmd::POLL_FIELDS, self.instance)
    }

    /// Drop to `Error` if the device has not reported its link within `timeout`
    ///
    /// Returns whether the link was declared lost by this call.
    pub fn check_link(&mut self, now: Instant, timeout: Duration) -> bool {
        if !self.connection.is_connected() {
            return false;
        }
        let Some(last) = self.last_link_report else {
            return false;
        };
        if now.saturating_duration_since(last) > timeout {
            warn!(
                "RMD {}: no link report for {:?}, marking disconnected",
                self.instance, timeout
            );
            self.connection = ConnectionState::Error("Status timeout".to_string());
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Flip between running and stopped
    pub fn toggle_running(&mut self) -> Result<RunState> {
        match self.run_state {
            RunState::Stopped => {
                info!("RMD {}: start", self.instance);
                self.bus
                    .send_value(SUBSYSTEM, fields::START, 0, self.instance)?;
                self.run_state = RunState::Running;
            }
            RunState::Running => self.stop()?,
        }
        Ok(self.run_state)
    }

    /// Stop the actuator and cancel any pending guard
    pub fn stop(&mut self) -> Result<()> {
        info!("RMD {}: stop", self.instance);
        self.bus
            .send_value(SUBSYSTEM, fields::STOP, 0, self.instance)?;
        self.guard.disarm();
        self.run_state = RunState::Stopped;
        Ok(())
    }

    /// Encode and send a motion command, then arm the guard
    ///
    /// Out-of-range inputs fail with a `RangeError` before anything is sent.
    pub fn send_motion(&mut self, command: &MotionCommand, now: Instant) -> Result<MotionWord> {
        let word = command.encode(&self.profile.motion)?;

        info!(
            "RMD {}: motion to {:.2} deg at {:.2} deg/s",
            self.instance, command.position_deg, command.velocity_deg_s
        );
        self.bus.send_value_at(
            SUBSYSTEM,
            fields::MOTION,
            i64::from(word.low()),
            i64::from(word.high()),
            self.instance,
        )?;

        self.guard.arm(now, self.pid_cache);
        self.run_state = RunState::Running;
        Ok(word)
    }

    /// Drive to zero with the profile's homing gains
    ///
    /// The gain override is not cached, so the guard restores the gains the
    /// device had before homing. The home motion is encoded before the
    /// override goes out, so a `RangeError` leaves the device gains untouched.
    pub fn home(&mut self, now: Instant) -> Result<MotionWord> {
        let command = MotionCommand::new(
            0.0,
            0.0,
            self.profile.home_position_gain,
            self.profile.home_velocity_gain,
            0.0,
        );
        command.encode(&self.profile.motion)?;

        let override_pid = self.profile.home_pid;
        info!("RMD {}: home with gains {:?}", self.instance, override_pid);
        self.send_pid(&override_pid)?;
        self.send_motion(&command, now)
    }

    /// Write new gains and remember them
    pub fn submit_pid(&mut self, pid: &PidParameters) -> Result<()> {
        info!("RMD {}: submit PID {:?}", self.instance, pid);
        self.send_pid(pid)?;
        self.pid_cache = Some(*pid);
        Ok(())
    }

    fn send_pid(&self, pid: &PidParameters) -> Result<()> {
        // Reserved high bytes are zero, so the word is non-negative as i64
        let word = encode_pid(pid) as i64;
        self.bus
            .send_value(SUBSYSTEM, fields::PID, word, self.instance)
    }

    pub fn read_pid(&self) -> Result<()> {
        self.bus.send_command(SUBSYSTEM, fields::PID, self.instance)
    }

    /// Zero the multi-turn offset at the current position
    pub fn set_offset(&self) -> Result<()> {
        self.bus
            .send_value(SUBSYSTEM, fields::MULTI_OFFSET, 0, self.instance)
    }

    pub fn reset_multiturn(&self) -> Result<()> {
        self.bus.send_value(
            SUBSYSTEM,
            fields::FUNCTION,
            rmd::FUNCTION_RESET_MULTITURN,
            self.instance,
        )
    }

    /// Write the RMD baudrate preset
    ///
    /// Returns `false` without sending when baudrate writes are disabled.
    pub fn set_rmd_baudrate(&self, preset: u8) -> Result<bool> {
        if !self.enable_baudrate_write {
            warn!(
                "RMD {}: baudrate write to preset {} ignored, writes disabled",
                self.instance, preset
            );
            return Ok(false);
        }
        self.bus
            .send_value(SUBSYSTEM, fields::BAUDRATE, i64::from(preset), self.instance)?;
        Ok(true)
    }

    /// Change the bridge CAN id and refresh the static fields
    pub fn apply_can_id(&mut self, can_id: u8) -> Result<()> {
        info!("RMD {}: CAN id -> {}", self.instance, can_id);
        self.bus
            .send_value(SUBSYSTEM, fields::CAN_ID, i64::from(can_id), self.instance)?;
        self.show()
    }

    /// Write the torque limit [N·m]
    pub fn apply_max_torque(&self, torque_nm: f64) -> Result<()> {
        let raw = (torque_nm * self.profile.scaling.max_torque_divisor) as i64;
        self.bus
            .send_value(SUBSYSTEM, fields::MAX_TORQUE, raw, self.instance)
    }

    // ------------------------------------------------------------------
    // Guard
    // ------------------------------------------------------------------

    /// Stop the actuator if the guard deadline has passed
    ///
    /// Returns whether the guard fired.
    pub fn on_deadline(&mut self, now: Instant) -> Result<bool> {
        let Some(expired) = self.guard.poll(now) else {
            return Ok(false);
        };

        warn!(
            "RMD {}: no motion command for {:?}, stopping",
            self.instance,
            self.guard.timeout()
        );
        self.bus
            .send_value(SUBSYSTEM, fields::STOP, 0, self.instance)?;
        if let Some(pid) = expired.restore {
            self.submit_pid(&pid)?;
        }
        self.run_state = RunState::Stopped;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------

    /// Apply a value pushed by the bus
    ///
    /// Replies for other subsystems or instances are ignored.
    pub fn handle_reply(&mut self, reply: &Reply, now: Instant) {
        if reply.subsystem != SUBSYSTEM || reply.instance != self.instance {
            return;
        }

        let v = reply.value;
        let t = &mut self.telemetry;
        match reply.field.as_str() {
            fields::CONNECTED => {
                self.last_link_report = Some(now);
                let connected = v != 0;
                if connected != self.connection.is_connected() {
                    info!("RMD {}: connected={}", self.instance, connected);
                }
                self.connection = if connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
            }
            fields::CAN_ID => t.can_id = Some(v),
            fields::CAN_SPEED => t.can_speed = Some(v),
            fields::MAX_TORQUE => t.max_torque = Some(v),
            fields::ERRORS => t.errors = Some(v as u32),
            fields::STATE => t.state = Some(v),
            fields::VOLTAGE => t.voltage = Some(v),
            fields::ABS_POSITION => {}
            fields::POS_TURNS => t.pos_turns = Some(v),
            fields::POS_TURNS_OFFSET => t.pos_turns_offset = Some(v),
            fields::SINGLE_POS => t.single_pos = Some(v),
            fields::SINGLE_OFFSET => t.single_offset = Some(v),
            fields::MULTI_POS => t.multi_pos = Some(v),
            fields::MULTI_POS_RAW => t.multi_pos_raw = Some(v),
            fields::MULTI_OFFSET => t.multi_offset = Some(v),
            fields::SINGLE_ANGLE | fields::MULTI_ANGLE => t.angle = Some(v),
            fields::TORQUE => t.torque = Some(v),
            fields::PID => {
                let pid = decode_pid(v as u64);
                debug!("RMD {}: PID read {:?}", self.instance, pid);
                self.pid_cache = Some(pid);
            }
            fields::MOTION => {
                let motion = MotionReply::from_signed(v);
                debug!("RMD {}: motion reply 0x{:016X}", self.instance, motion.raw());
                t.motion = Some(motion);
            }
            other => debug!("RMD {}: ignoring field {}", self.instance, other),
        }
    }

    // ------------------------------------------------------------------
    // Status text
    // ------------------------------------------------------------------

    pub fn error_text(&self) -> String {
        match self.telemetry.errors {
            Some(mask) => rmd::describe_errors(mask, &self.profile, &self.connection),
            None if !self.connection.is_connected() => rmd::NOT_CONNECTED.to_string(),
            None => String::new(),
        }
    }

    pub fn state_text(&self) -> String {
        match self.telemetry.state {
            Some(index) => rmd::describe_state(index, &self.profile, &self.connection),
            None if !self.connection.is_connected() => rmd::NOT_CONNECTED.to_string(),
            None => String::new(),
        }
    }

    pub fn voltage_text(&self) -> String {
        match self.telemetry.voltage {
            Some(raw) => rmd::describe_voltage(raw, &self.profile, &self.connection),
            None if !self.connection.is_connected() => rmd::NOT_CONNECTED.to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelBus, Outbound};
    use crate::error::RangeError;
    use tokio::sync::mpsc::UnboundedReceiver;

    const INSTANCE: u8 = 0;

    fn panel() -> (RmdPanel<ChannelBus>, UnboundedReceiver<Outbound>) {
        let (bus, rx) = ChannelBus::new();
        (RmdPanel::new(bus, INSTANCE, FirmwareProfile::rmd_x()), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn value(field: &'static str, value: i64) -> Outbound {
        Outbound::Value {
            subsystem: SUBSYSTEM,
            field,
            value,
            address: None,
            instance: INSTANCE,
        }
    }

    fn reply(field: &str, value: i64) -> Reply {
        Reply::new(SUBSYSTEM, field, INSTANCE, value)
    }

    fn gains() -> PidParameters {
        PidParameters {
            ip: 11,
            ii: 12,
            vp: 13,
            vi: 14,
            kp: 15,
            ki: 16,
        }
    }

    #[test]
    fn test_show_requests_static_fields() {
        let (mut panel, mut rx) = panel();
        panel.show().unwrap();
        assert!(panel.is_visible());
        let sent: Vec<_> = drain(&mut rx).iter().map(Outbound::field).collect();
        assert_eq!(sent, vec!["canid", "canspd", "maxtorque"]);
    }

    #[test]
    fn test_poll_requests_status_fields() {
        let (mut panel, mut rx) = panel();
        panel.poll().unwrap();
        let sent: Vec<_> = drain(&mut rx).iter().map(Outbound::field).collect();
        assert_eq!(sent, rmd::POLL_FIELDS.to_vec());
        assert!(sent.contains(&"errors"));
    }

    #[test]
    fn test_toggle_running() {
        let (mut panel, mut rx) = panel();
        assert_eq!(panel.toggle_running().unwrap(), RunState::Running);
        assert_eq!(panel.toggle_running().unwrap(), RunState::Stopped);
        assert_eq!(drain(&mut rx), vec![value("start", 0), value("stop", 0)]);
    }

    #[test]
    fn test_send_motion_splits_word_and_arms_guard() {
        let (mut panel, mut rx) = panel();
        let now = Instant::now();
        let cmd = MotionCommand::new(90.0, 30.0, 100.0, 1.0, 2.0);

        let word = panel.send_motion(&cmd, now).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Value {
                subsystem: SUBSYSTEM,
                field: "motion",
                value: i64::from(word.low()),
                address: Some(i64::from(word.high())),
                instance: INSTANCE,
            }]
        );
        assert_eq!(panel.guard().deadline(), Some(now + Duration::from_millis(3000)));
        assert_eq!(panel.run_state(), RunState::Running);
    }

    #[test]
    fn test_out_of_range_motion_sends_nothing() {
        let (mut panel, mut rx) = panel();
        let cmd = MotionCommand::new(0.0, 0.0, 0.0, 0.0, 100.0);

        let err = panel.send_motion(&cmd, Instant::now()).unwrap_err();

        assert!(err.downcast_ref::<RangeError>().is_some());
        assert!(drain(&mut rx).is_empty());
        assert!(!panel.guard().is_armed());
    }

    #[test]
    fn test_guard_stops_and_restores_gains() {
        let (mut panel, mut rx) = panel();
        let t0 = Instant::now();
        panel.handle_reply(&reply("pid", encode_pid(&gains()) as i64), t0);

        panel
            .send_motion(&MotionCommand::new(10.0, 0.0, 50.0, 1.0, 0.0), t0)
            .unwrap();
        drain(&mut rx);

        assert!(!panel.on_deadline(t0 + Duration::from_millis(2999)).unwrap());
        assert!(drain(&mut rx).is_empty());

        assert!(panel.on_deadline(t0 + Duration::from_millis(3000)).unwrap());
        assert_eq!(
            drain(&mut rx),
            vec![
                value("stop", 0),
                value("pid", encode_pid(&gains()) as i64)
            ]
        );
        assert_eq!(panel.run_state(), RunState::Stopped);
        assert!(!panel.on_deadline(t0 + Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn test_rearm_defers_stop() {
        let (mut panel, mut rx) = panel();
        let t0 = Instant::now();
        let cmd = MotionCommand::new(10.0, 0.0, 50.0, 1.0, 0.0);
        panel.send_motion(&cmd, t0).unwrap();
        panel
            .send_motion(&cmd, t0 + Duration::from_millis(1000))
            .unwrap();
        drain(&mut rx);

        assert!(!panel.on_deadline(t0 + Duration::from_millis(3000)).unwrap());
        assert!(drain(&mut rx).is_empty());
        assert!(panel.on_deadline(t0 + Duration::from_millis(4000)).unwrap());
        // Nothing cached, so only the stop goes out
        assert_eq!(drain(&mut rx), vec![value("stop", 0)]);
    }

    #[test]
    fn test_explicit_stop_cancels_guard() {
        let (mut panel, mut rx) = panel();
        let t0 = Instant::now();
        panel
            .send_motion(&MotionCommand::new(0.0, 0.0, 0.0, 0.0, 0.0), t0)
            .unwrap();
        assert_eq!(panel.toggle_running().unwrap(), RunState::Stopped);
        drain(&mut rx);

        assert!(!panel.on_deadline(t0 + Duration::from_millis(3000)).unwrap());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_home_overrides_gains_without_caching() {
        let (mut panel, mut rx) = panel();
        let t0 = Instant::now();
        panel.submit_pid(&gains()).unwrap();
        drain(&mut rx);

        panel.home(t0).unwrap();
        let sent = drain(&mut rx);
        let home_pid = FirmwareProfile::rmd_x().home_pid;
        assert_eq!(sent[0], value("pid", encode_pid(&home_pid) as i64));
        assert_eq!(sent[1].field(), "motion");
        assert_eq!(panel.pid_cache(), Some(gains()));

        assert!(panel.on_deadline(t0 + Duration::from_millis(3000)).unwrap());
        assert_eq!(
            drain(&mut rx),
            vec![
                value("stop", 0),
                value("pid", encode_pid(&gains()) as i64)
            ]
        );
    }

    #[test]
    fn test_simple_writes() {
        let (mut panel, mut rx) = panel();
        panel.set_offset().unwrap();
        panel.reset_multiturn().unwrap();
        panel.apply_max_torque(3.25).unwrap();
        panel.read_pid().unwrap();
        assert!(!panel.set_rmd_baudrate(2).unwrap());
        panel.apply_can_id(5).unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent[0], value("multi_offset", 0));
        assert_eq!(sent[1], value("function", 1));
        assert_eq!(sent[2], value("maxtorque", 325));
        assert_eq!(sent[3].field(), "pid");
        assert_eq!(sent[4], value("canid", 5));
        assert_eq!(sent[5].field(), "canid");
        assert_eq!(sent.len(), 8);
    }

    #[test]
    fn test_baudrate_write_when_enabled() {
        let (bus, mut rx) = ChannelBus::new();
        let panel = RmdPanel::new(bus, INSTANCE, FirmwareProfile::rmd_x()).with_baudrate_write(true);
        assert!(panel.set_rmd_baudrate(2).unwrap());
        assert_eq!(drain(&mut rx), vec![value("baudrate", 2)]);
    }

    #[test]
    fn test_replies_update_telemetry_and_text() {
        let (mut panel, _rx) = panel();
        let now = Instant::now();

        panel.handle_reply(&reply("errors", 0x0002), now);
        panel.handle_reply(&reply("state", 3), now);
        panel.handle_reply(&reply("voltage", 241), now);
        assert_eq!(panel.error_text(), "Not connected");
        assert_eq!(panel.state_text(), "Not connected");
        assert_eq!(panel.voltage_text(), "Not connected");

        panel.handle_reply(&reply("connected", 1), now);
        assert_eq!(panel.error_text(), "motor_stall");
        assert_eq!(panel.state_text(), "RUNNING");
        assert_eq!(panel.voltage_text(), "24.1V");

        panel.handle_reply(&reply("pos_turns", 12_345), now);
        panel.handle_reply(&reply("multi_ang", -900), now);
        panel.handle_reply(&reply("motion", -2), now);
        let t = panel.telemetry();
        assert_eq!(t.pos_turns, Some(12_345));
        assert_eq!(t.angle, Some(-900));
        assert_eq!(t.motion.map(|m| m.raw()), Some(u64::MAX - 1));

        panel.handle_reply(&reply("connected", 0), now);
        assert_eq!(panel.error_text(), "Not connected");
    }

    #[test]
    fn test_foreign_replies_ignored() {
        let (mut panel, _rx) = panel();
        let now = Instant::now();
        panel.handle_reply(&Reply::new("axis", "connected", INSTANCE, 1), now);
        panel.handle_reply(&Reply::new(SUBSYSTEM, "connected", INSTANCE + 1, 1), now);
        assert_eq!(panel.connection(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_check_link_timeout() {
        let (mut panel, _rx) = panel();
        let t0 = Instant::now();
        let timeout = Duration::from_millis(500);

        assert!(!panel.check_link(t0, timeout));
        panel.handle_reply(&reply("connected", 1), t0);
        assert!(!panel.check_link(t0 + timeout, timeout));
        assert!(panel.check_link(t0 + Duration::from_millis(501), timeout));
        assert_eq!(
            panel.connection(),
            &ConnectionState::Error("Status timeout".to_string())
        );
        assert_eq!(panel.error_text(), "Not connected");
    }

    #[test]
    fn test_home_with_out_of_range_gain_sends_nothing() {
        let (bus, mut rx) = ChannelBus::new();
        let mut profile = FirmwareProfile::rmd_x();
        profile.home_position_gain = 600.0;
        let mut panel = RmdPanel::new(bus, INSTANCE, profile);
        panel.submit_pid(&gains()).unwrap();
        drain(&mut rx);

        let err = panel.home(Instant::now()).unwrap_err();
        assert!(err.downcast_ref::<RangeError>().is_some());
        assert!(drain(&mut rx).is_empty());
        assert!(!panel.guard().is_armed());
        assert_eq!(panel.run_state(), RunState::Stopped);
    }

    #[test]
    fn test_text_empty_until_first_reply() {
        let (mut panel, _rx) = panel();
        let now = Instant::now();
        panel.handle_reply(&reply("connected", 1), now);
        assert_eq!(panel.error_text(), "");
        assert_eq!(panel.state_text(), "");
        assert_eq!(panel.voltage_text(), "");
        assert_eq!(panel.telemetry().turns(&panel.profile().scaling), None);

        panel.handle_reply(&reply("errors", 0), now);
        assert_eq!(panel.error_text(), "None");
    }
}
