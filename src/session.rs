//! Panel event loop
//!
//! One task multiplexes user intents, bus replies, the telemetry poll timer
//! and the motion guard deadline. The panel is only touched from here.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::bus::{Bus, Reply};
use crate::error::RangeError;
use crate::panel::RmdPanel;
use crate::rmd::{MotionCommand, PidParameters};

/// User intent delivered to the session
#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    /// Panel became visible: start polling
    Show,
    /// Panel hidden: stop polling
    Hide,
    ToggleRunning,
    Stop,
    Motion(MotionCommand),
    Home,
    SubmitPid(PidParameters),
    ReadPid,
    SetOffset,
    ResetMultiturn,
    SetBaudrate(u8),
    ApplyCanId(u8),
    /// Torque limit [N·m]
    ApplyMaxTorque(f64),
}

enum Wake {
    Event(Option<PanelEvent>),
    Reply(Option<Reply>),
    Poll,
    Deadline,
}

pub struct Session<B: Bus> {
    panel: RmdPanel<B>,
    link_timeout: Option<Duration>,
    poll: Option<Interval>,
}

impl<B: Bus> Session<B> {
    pub fn new(panel: RmdPanel<B>, link_timeout: Option<Duration>) -> Self {
        Self {
            panel,
            link_timeout,
            poll: None,
        }
    }

    pub fn panel(&self) -> &RmdPanel<B> {
        &self.panel
    }

    /// Run until the event sender is dropped, then hand the panel back
    ///
    /// A motion command with out-of-range inputs is logged and dropped; bus
    /// failures end the session.
    pub async fn run(
        mut self,
        mut events: UnboundedReceiver<PanelEvent>,
        mut replies: UnboundedReceiver<Reply>,
    ) -> Result<RmdPanel<B>> {
        info!("RMD {} session started", self.panel.instance());
        let mut replies_open = true;

        loop {
            let deadline = self.panel.guard().deadline();

            let wake = tokio::select! {
                event = events.recv() => Wake::Event(event),
                reply = replies.recv(), if replies_open => Wake::Reply(reply),
                _ = next_tick(&mut self.poll) => Wake::Poll,
                _ = reached(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Event(Some(event)) => {
                    debug!("Panel event: {:?}", event);
                    if let Err(e) = self.handle_event(event) {
                        match e.downcast::<RangeError>() {
                            Ok(range) => error!("Motion command rejected: {}", range),
                            Err(e) => return Err(e.context("Panel event failed")),
                        }
                    }
                }
                Wake::Event(None) => break,
                Wake::Reply(Some(reply)) => self.panel.handle_reply(&reply, Instant::now()),
                Wake::Reply(None) => {
                    info!("Reply channel closed");
                    replies_open = false;
                }
                Wake::Poll => {
                    self.panel.poll().context("Telemetry poll failed")?;
                    if let Some(timeout) = self.link_timeout {
                        self.panel.check_link(Instant::now(), timeout);
                    }
                }
                Wake::Deadline => {
                    self.panel
                        .on_deadline(Instant::now())
                        .context("Motion guard stop failed")?;
                }
            }
        }

        info!("RMD {} session ended", self.panel.instance());
        Ok(self.panel)
    }

    fn handle_event(&mut self, event: PanelEvent) -> Result<()> {
        let panel = &mut self.panel;
        match event {
            PanelEvent::Show => {
                panel.show()?;
                if self.poll.is_none() {
                    let mut interval = time::interval(panel.profile().poll_period());
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.poll = Some(interval);
                    debug!("Telemetry poll started");
                }
            }
            PanelEvent::Hide => {
                panel.hide();
                if self.poll.take().is_some() {
                    debug!("Telemetry poll stopped");
                }
            }
            PanelEvent::ToggleRunning => {
                panel.toggle_running()?;
            }
            PanelEvent::Stop => panel.stop()?,
            PanelEvent::Motion(command) => {
                panel.send_motion(&command, Instant::now())?;
            }
            PanelEvent::Home => {
                panel.home(Instant::now())?;
            }
            PanelEvent::SubmitPid(pid) => panel.submit_pid(&pid)?,
            PanelEvent::ReadPid => panel.read_pid()?,
            PanelEvent::SetOffset => panel.set_offset()?,
            PanelEvent::ResetMultiturn => panel.reset_multiturn()?,
            PanelEvent::SetBaudrate(preset) => {
                panel.set_rmd_baudrate(preset)?;
            }
            PanelEvent::ApplyCanId(can_id) => panel.apply_can_id(can_id)?,
            PanelEvent::ApplyMaxTorque(torque) => panel.apply_max_torque(torque)?,
        }
        Ok(())
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
