//! PHY-MAC Service Access Points
//!
//! The slot engine drives the scheduler through [`PhySapUser`]; the scheduler
//! pushes its decisions back through the [`PhySapProvider`] handed to it.

use crate::message_types::{ControlMessage, DciInfo, MacPdu, SlotAllocation, UlCqiInfo, UlHarqInfo};
use common::{SlotAddress, SlotType};

/// Calls the scheduler makes into the PHY
pub trait PhySapProvider {
    /// Queue the allocation for a future slot
    fn set_slot_alloc_info(&mut self, alloc: SlotAllocation);

    /// Queue a PDU for the burst at (pdu.slot, pdu.sym_start)
    fn send_mac_pdu(&mut self, pdu: MacPdu);

    /// Queue a control message; it goes on air after the L1/L2 latency
    fn enqueue_ctrl_message(&mut self, msg: ControlMessage);

    fn slot_alloc_info_exists(&self, slot: &SlotAddress) -> bool;
}

/// Calls the PHY makes into the scheduler
pub trait PhySapUser {
    /// Schedule downlink for `slot`, which has type `slot_type`
    fn slot_dl_indication(
        &mut self,
        slot: SlotAddress,
        slot_type: SlotType,
        phy: &mut dyn PhySapProvider,
    );

    /// Schedule uplink for `slot`, which has type `slot_type`
    fn slot_ul_indication(
        &mut self,
        slot: SlotAddress,
        slot_type: SlotType,
        phy: &mut dyn PhySapProvider,
    );

    fn set_current_slot(&mut self, slot: SlotAddress);

    /// Baseline DL control descriptor
    fn get_dl_ctrl_dci(&self) -> DciInfo;

    /// Baseline UL control descriptor
    fn get_ul_ctrl_dci(&self) -> DciInfo;

    fn receive_control_message(&mut self, msg: ControlMessage);

    fn receive_rach_preamble(&mut self, rap_id: u32);

    fn ul_cqi_report(&mut self, cqi: UlCqiInfo);

    fn ul_harq_feedback(&mut self, info: UlHarqInfo);

    fn receive_phy_pdu(&mut self, pdu: MacPdu);
}
