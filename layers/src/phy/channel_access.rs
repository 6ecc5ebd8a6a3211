//! Channel Access State
//!
//! Grant/release bookkeeping of a contested medium for one slot engine.

use super::{PhyContext, PhyEvent};
use common::{EventId, ProtocolViolation};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Channel access status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Channel not granted
    None,
    /// Channel access requested
    Requested,
    /// Channel access granted
    Granted,
    /// Channel granted, released at the end of the current slot
    ToLose,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelStatus::None => "NONE",
            ChannelStatus::Requested => "REQUESTED",
            ChannelStatus::Granted => "GRANTED",
            ChannelStatus::ToLose => "TO_LOSE",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct ChannelAccess {
    status: ChannelStatus,
    /// Pending expiry of the current grant
    lost_timer: Option<EventId>,
}

impl Default for ChannelAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelAccess {
    pub fn new() -> Self {
        Self {
            status: ChannelStatus::None,
            lost_timer: None,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn is_granted(&self) -> bool {
        self.status == ChannelStatus::Granted
    }

    pub fn lost_timer(&self) -> Option<EventId> {
        self.lost_timer
    }

    /// NONE -> REQUESTED.
    ///
    /// Only a channel in NONE can be requested. REQUESTED and GRANTED are
    /// duplicate requests, and so is TO_LOSE: the grant still runs until the
    /// slot boundary.
    pub fn request(&mut self) -> Result<(), ProtocolViolation> {
        if self.status != ChannelStatus::None {
            return Err(ProtocolViolation::DuplicateAccessRequest(self.status.to_string()));
        }
        debug!("Requesting channel access");
        self.status = ChannelStatus::Requested;
        Ok(())
    }

    /// Apply a grant of `duration`. Returns whether the channel is now held.
    pub fn grant(&mut self, ctx: &mut PhyContext<'_>, duration: Duration, slot_period: Duration) -> bool {
        if self.status != ChannelStatus::Requested {
            warn!("Channel access grant of {:?} while in state {}, ignoring", duration, self.status);
            return false;
        }

        if duration < slot_period {
            info!(
                "Grant of {:?} shorter than a slot ({:?}), releasing",
                duration, slot_period
            );
            self.status = ChannelStatus::None;
            return false;
        }

        let slots = (duration.as_nanos() / slot_period.as_nanos().max(1)).max(1);
        let expiry_ns = u64::try_from(slots * slot_period.as_nanos()).unwrap_or(u64::MAX);
        let expiry = Duration::from_nanos(expiry_ns);

        self.cancel_timer(ctx);
        self.lost_timer = Some(ctx.schedule(expiry, PhyEvent::ChannelAccessLost));
        self.status = ChannelStatus::Granted;
        info!("Channel access granted for {} slots ({:?})", slots, expiry);
        true
    }

    /// Any state -> NONE, cancelling the expiry
    pub fn deny(&mut self, ctx: &mut PhyContext<'_>) {
        info!("Channel access denied in state {}", self.status);
        self.cancel_timer(ctx);
        self.status = ChannelStatus::None;
    }

    /// Expiry timer fired
    pub fn lost(&mut self) {
        info!("Channel access lost in state {}", self.status);
        self.lost_timer = None;
        self.status = ChannelStatus::None;
    }

    /// GRANTED -> TO_LOSE
    pub fn mark_to_lose(&mut self) {
        if self.status == ChannelStatus::Granted {
            debug!("Channel will be released at the end of the slot");
            self.status = ChannelStatus::ToLose;
        }
    }

    /// Slot boundary: TO_LOSE -> NONE
    pub fn end_slot(&mut self, ctx: &mut PhyContext<'_>) {
        if self.status == ChannelStatus::ToLose {
            debug!("Releasing channel at slot end");
            self.cancel_timer(ctx);
            self.status = ChannelStatus::None;
        }
    }

    fn cancel_timer(&mut self, ctx: &mut PhyContext<'_>) {
        if let Some(id) = self.lost_timer.take() {
            ctx.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::{EndpointId, SimEvent};
    use common::EventQueue;

    const SLOT: Duration = Duration::from_micros(500);

    #[test]
    fn test_request_grant_expiry() {
        let mut queue: EventQueue<SimEvent> = EventQueue::new();
        let mut ctx = PhyContext::new(&mut queue, EndpointId(0));
        let mut access = ChannelAccess::new();

        access.request().unwrap();
        assert_eq!(access.status(), ChannelStatus::Requested);
        assert!(access.grant(&mut ctx, Duration::from_micros(1200), SLOT));
        assert_eq!(access.status(), ChannelStatus::Granted);
        let timer = access.lost_timer().unwrap();
        assert!(ctx.is_pending(timer));

        // Expiry lands after floor(1200 / 500) = 2 slots
        let (at, event) = queue.pop().unwrap();
        assert_eq!(at, SLOT * 2);
        assert!(matches!(event.event, PhyEvent::ChannelAccessLost));
    }

    #[test]
    fn test_short_grant_releases() {
        let mut queue: EventQueue<SimEvent> = EventQueue::new();
        let mut ctx = PhyContext::new(&mut queue, EndpointId(0));
        let mut access = ChannelAccess::new();

        access.request().unwrap();
        assert!(!access.grant(&mut ctx, Duration::from_micros(100), SLOT));
        assert_eq!(access.status(), ChannelStatus::None);
        assert!(access.lost_timer().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_grant_without_request_is_ignored() {
        let mut queue: EventQueue<SimEvent> = EventQueue::new();
        let mut ctx = PhyContext::new(&mut queue, EndpointId(0));
        let mut access = ChannelAccess::new();

        assert!(!access.grant(&mut ctx, Duration::from_millis(5), SLOT));
        assert_eq!(access.status(), ChannelStatus::None);
    }

    #[test]
    fn test_deny_cancels_expiry() {
        let mut queue: EventQueue<SimEvent> = EventQueue::new();
        let mut ctx = PhyContext::new(&mut queue, EndpointId(0));
        let mut access = ChannelAccess::new();

        access.request().unwrap();
        access.grant(&mut ctx, Duration::from_millis(5), SLOT);
        let timer = access.lost_timer().unwrap();
        access.deny(&mut ctx);

        assert_eq!(access.status(), ChannelStatus::None);
        assert!(!ctx.is_pending(timer));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_duplicate_request() {
        let mut access = ChannelAccess::new();
        access.request().unwrap();
        assert_eq!(
            access.request(),
            Err(ProtocolViolation::DuplicateAccessRequest("REQUESTED".to_string()))
        );
    }

    #[test]
    fn test_to_lose_released_at_slot_end() {
        let mut queue: EventQueue<SimEvent> = EventQueue::new();
        let mut ctx = PhyContext::new(&mut queue, EndpointId(0));
        let mut access = ChannelAccess::new();

        access.request().unwrap();
        access.grant(&mut ctx, Duration::from_millis(5), SLOT);
        let timer = access.lost_timer().unwrap();

        access.mark_to_lose();
        assert_eq!(access.status(), ChannelStatus::ToLose);
        assert_eq!(
            access.request(),
            Err(ProtocolViolation::DuplicateAccessRequest("TO_LOSE".to_string()))
        );

        access.end_slot(&mut ctx);
        assert_eq!(access.status(), ChannelStatus::None);
        assert!(!ctx.is_pending(timer));
    }
}
