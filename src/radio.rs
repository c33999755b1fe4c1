//! Contract between the engine and the transceiver driver.
//!
//! The driver owns register access, IRQ wiring and channel configuration;
//! the engine only ever asks it to configure identity, keep the receiver
//! armed, and transmit, immediately or at an armed future device time.

use crate::time::Timestamp;
use crate::{Eui, ShortAddress};

/// Operating profiles of a DW1000-class transceiver (data-rate /
/// preamble-length trade-offs); the driver maps these onto channel, PRF and
/// data-rate registers.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    ShortDataFastAccuracy,
    LongDataFastAccuracy,
    ShortDataMidAccuracy,
    LongDataMidAccuracy,
    LongDataRangeLowPower,
    LongDataRangeAccuracy,
}

/// Signal-quality readbacks for the most recently received frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct RxQuality {
    pub rx_power_dbm: f32,
    pub first_path_power_dbm: f32,
    pub receive_quality: f32,
}

/// Transceiver driver surface the engine drives.
///
/// Two timing-critical expectations:
///
/// - `start_receive` arms *permanent* receive: the driver re-arms RX after
///   every transmission itself, so the engine never touches the receiver in
///   a hot path.
/// - [`arm_delayed_tx`](Radio::arm_delayed_tx) reveals the antenna-departure
///   device time *before* the frame is written; the RANGE payload embeds
///   that very timestamp. The next `transmit` call uses the armed slot.
pub trait Radio {
    type Error: core::fmt::Debug;

    /// Programs short address, network id and operating mode.
    fn configure(
        &mut self,
        short: ShortAddress,
        pan_id: u16,
        mode: RadioMode,
    ) -> Result<(), Self::Error>;

    fn set_eui(&mut self, eui: &Eui) -> Result<(), Self::Error>;

    /// Arms permanent receive.
    fn start_receive(&mut self) -> Result<(), Self::Error>;

    /// Sends a frame: immediately, or in the slot armed by the preceding
    /// [`arm_delayed_tx`](Radio::arm_delayed_tx).
    fn transmit(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Schedules the next transmission `delay_us` from now; returns the
    /// device time at which it will leave the antenna.
    fn arm_delayed_tx(&mut self, delay_us: u32) -> Result<Timestamp, Self::Error>;

    fn last_rx_power_dbm(&mut self) -> f32;

    fn last_first_path_power_dbm(&mut self) -> f32;

    fn last_receive_quality(&mut self) -> f32;
}
