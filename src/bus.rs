// Application bus seam: fire-and-forget writes and read requests out,
// (subsystem, field, instance) keyed replies in.
use std::fmt;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write `value` (and optional `address`) to a field
    Value {
        subsystem: &'static str,
        field: &'static str,
        value: i64,
        address: Option<i64>,
        instance: u8,
    },
    /// Request the current value of a field
    Command {
        subsystem: &'static str,
        field: &'static str,
        instance: u8,
    },
}

impl Outbound {
    pub fn field(&self) -> &'static str {
        match self {
            Outbound::Value { field, .. } | Outbound::Command { field, .. } => *field,
        }
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Value {
                subsystem,
                field,
                value,
                address: Some(address),
                instance,
            } => write!(f, "{}.{}.{}={}?{}", subsystem, instance, field, value, address),
            Outbound::Value {
                subsystem,
                field,
                value,
                address: None,
                instance,
            } => write!(f, "{}.{}.{}={}", subsystem, instance, field, value),
            Outbound::Command {
                subsystem,
                field,
                instance,
            } => write!(f, "{}.{}.{}?", subsystem, instance, field),
        }
    }
}

/// Value pushed by the bus for a registered (subsystem, field, instance)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub subsystem: String,
    pub field: String,
    pub instance: u8,
    pub value: i64,
}

impl Reply {
    pub fn new(subsystem: &str, field: &str, instance: u8, value: i64) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            field: field.to_string(),
            instance,
            value,
        }
    }
}

/// Outbound half of the application bus
///
/// Sends never block and never wait for a reply.
pub trait Bus {
    fn send(&self, message: Outbound) -> Result<()>;

    fn send_value(
        &self,
        subsystem: &'static str,
        field: &'static str,
        value: i64,
        instance: u8,
    ) -> Result<()> {
        self.send(Outbound::Value {
            subsystem,
            field,
            value,
            address: None,
            instance,
        })
    }

    /// Write a value split across the value and address parameters
    fn send_value_at(
        &self,
        subsystem: &'static str,
        field: &'static str,
        value: i64,
        address: i64,
        instance: u8,
    ) -> Result<()> {
        self.send(Outbound::Value {
            subsystem,
            field,
            value,
            address: Some(address),
            instance,
        })
    }

    fn send_command(
        &self,
        subsystem: &'static str,
        field: &'static str,
        instance: u8,
    ) -> Result<()> {
        self.send(Outbound::Command {
            subsystem,
            field,
            instance,
        })
    }

    fn send_commands(
        &self,
        subsystem: &'static str,
        fields: &[&'static str],
        instance: u8,
    ) -> Result<()> {
        for &field in fields {
            self.send_command(subsystem, field, instance)?;
        }
        Ok(())
    }
}

/// Bus backed by an unbounded channel
///
/// The receiving end is handed to whatever forwards messages to the device,
/// or inspected directly in tests.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Bus for ChannelBus {
    fn send(&self, message: Outbound) -> Result<()> {
        debug!("Bus send: {}", message);
        self.tx.send(message).context("Bus receiver dropped")
    }
}
