use super::command::{Command, CommandSender};
use super::registry::SegmentRegistry;
use crate::config::TransferSettings;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Instant;
use tracing::debug;

/// Manager-owned state a transfer may touch while handling one event.
pub struct TransferContext<'a> {
    commands: &'a CommandSender,
    pub segments: &'a mut SegmentRegistry,
    /// Hosts currently serving a download segment.
    pub downloading_hosts: &'a mut HashSet<IpAddr>,
    pub settings: &'a TransferSettings,
    pub now: Instant,
    /// Hosts whose capability the transfer is now waiting on; the manager
    /// resolves these after the transfer call returns.
    pub capability_requests: Vec<IpAddr>,
}

impl<'a> TransferContext<'a> {
    pub fn new(
        commands: &'a CommandSender,
        segments: &'a mut SegmentRegistry,
        downloading_hosts: &'a mut HashSet<IpAddr>,
        settings: &'a TransferSettings,
        now: Instant,
    ) -> Self {
        Self {
            commands,
            segments,
            downloading_hosts,
            settings,
            now,
            capability_requests: Vec::new(),
        }
    }

    pub fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Command channel closed, dropping command");
        }
    }
}
