//! The per-peer ranging protocol engine.
//!
//! One [`RangingEngine`] value owns the radio, the peer table and the intake
//! queue. Two entry points are meant for the (deferred) radio-interrupt
//! context and touch nothing but the queue and a latch:
//! [`radio_received`](RangingEngine::radio_received) and
//! [`radio_sent`](RangingEngine::radio_sent). Everything else (state
//! machines, timeouts, the emission ticker) runs inside
//! [`service_once`](RangingEngine::service_once), which the host must call
//! at millisecond cadence and which never blocks.

use crate::intake::{IntakeQueue, RxFrame};
use crate::mac_frame::{self, FrameDest, MessageKind};
use crate::peer::{AddError, Peer, PeerState, PeerTable};
use crate::radio::{Radio, RadioMode, RxQuality};
use crate::time::{self, Timestamp};
use crate::{
    Eui, EuiParseError, Host, Role, ShortAddress, BLINK_PERIOD_TICKS, DEFAULT_PAN_ID,
    DEFAULT_REPLY_DELAY_US, DEFAULT_RESET_MS, DEFAULT_TIMER_MS, FRAME_BUF_LEN,
    HARD_PROTOCOL_TIMEOUT_MS, INACTIVITY_MS, INTAKE_QUEUE_SIZE,
};

const DEFAULT_FILTER_WINDOW: u16 = 15;

/// How a device picks its short address at bring-up.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScheme {
    /// Leading two EUI bytes.
    EuiDerived,
    /// Two bytes from the host entropy source.
    Random,
}

/// Why `protocol_error` fired.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A message of this kind arrived while another was expected.
    Unexpected(MessageKind),
    /// No frame from this peer within the protocol timeout.
    Timeout,
    /// The intake queue was full; the frame was dropped.
    IntakeOverflow,
    /// A new peer could not be added.
    TableFull,
    /// The TWR arithmetic could not describe a physical flight; the peer
    /// was answered with RANGE_FAILED. (A tag on the receiving end of that
    /// answer sees `Unexpected(RangeFailed)` instead.)
    RangingFailed,
}

/// User hooks, all optional and all required to be non-blocking.
///
/// Implement the ones you care about; the rest default to no-ops. `()`
/// implements the trait for callers that want no callbacks at all.
pub trait RangingEvents {
    /// A new range value was stored for some peer (legacy, tag side).
    fn new_range(&mut self) {}

    /// An anchor saw a blink from a previously unknown tag.
    fn blink_peer(&mut self, _peer: &Peer) {}

    /// A tag received RANGING_INIT from a previously unknown anchor.
    fn new_peer(&mut self, _peer: &Peer) {}

    /// A peer aged out and was removed from the table.
    fn inactive_peer(&mut self, _peer: &Peer) {}

    /// A ranging exchange with this peer completed; `peer.range_m()` is
    /// fresh.
    fn range_complete(&mut self, _peer: &Peer) {}

    /// Something went wrong; `peer` is `None` for errors without peer
    /// context (queue or table overflow).
    fn protocol_error(&mut self, _peer: Option<&Peer>, _code: ErrorCode) {}
}

impl RangingEvents for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError<RE> {
    InvalidEui(EuiParseError),
    Radio(RE),
}

/// The protocol engine. See the crate docs for the exchange it drives.
pub struct RangingEngine<R: Radio, H: Host, E: RangingEvents> {
    radio: R,
    host: H,
    events: E,
    role: Role,
    eui: Eui,
    short_addr: ShortAddress,
    pan_id: u16,
    peers: PeerTable,
    intake: IntakeQueue,
    seq: u8,
    reply_delay_us: u16,
    timer_delay_ms: u32,
    /// Elongated while broadcast polls are in rotation.
    current_timer_ms: u32,
    reset_period_ms: u32,
    last_tick_ms: u64,
    blink_tick: u8,
    last_activity_ms: u64,
    filter_enabled: bool,
    filter_window: u16,
    /// TX-completion timestamp, written by `radio_sent`, consumed by
    /// `service_once`.
    tx_done: Option<Timestamp>,
    /// Kind of the frame whose completion `tx_done` will report.
    pending_tx: Option<MessageKind>,
    decode_errors: u32,
    #[cfg(feature = "exchange-data")]
    outbound_data: (u32, u32),
}

impl<R: Radio, H: Host, E: RangingEvents> RangingEngine<R, H, E> {
    /// Brings the device up as a mobile tag: it will blink until anchors
    /// answer, then poll them on the emission timer.
    pub fn start_as_tag(
        radio: R,
        host: H,
        events: E,
        eui: &str,
        mode: RadioMode,
        scheme: AddressScheme,
    ) -> Result<Self, StartError<R::Error>> {
        Self::start(Role::Tag, radio, host, events, eui, mode, scheme)
    }

    /// Brings the device up as a fixed anchor: receive-permanent, transmits
    /// only in response to BLINK and POLL.
    pub fn start_as_anchor(
        radio: R,
        host: H,
        events: E,
        eui: &str,
        mode: RadioMode,
        scheme: AddressScheme,
    ) -> Result<Self, StartError<R::Error>> {
        Self::start(Role::Anchor, radio, host, events, eui, mode, scheme)
    }

    fn start(
        role: Role,
        mut radio: R,
        mut host: H,
        events: E,
        eui: &str,
        mode: RadioMode,
        scheme: AddressScheme,
    ) -> Result<Self, StartError<R::Error>> {
        let eui: Eui = eui.parse().map_err(StartError::InvalidEui)?;
        let short_addr = match scheme {
            AddressScheme::EuiDerived => eui.short_address(),
            AddressScheme::Random => {
                ShortAddress(u16::from_be_bytes([host.random_u8(), host.random_u8()]))
            }
        };
        radio.set_eui(&eui).map_err(StartError::Radio)?;
        radio
            .configure(short_addr, DEFAULT_PAN_ID, mode)
            .map_err(StartError::Radio)?;
        radio.start_receive().map_err(StartError::Radio)?;

        let now = host.now_ms();
        Ok(RangingEngine {
            radio,
            host,
            events,
            role,
            eui,
            short_addr,
            pan_id: DEFAULT_PAN_ID,
            peers: PeerTable::new(),
            intake: IntakeQueue::new(),
            seq: 0,
            reply_delay_us: DEFAULT_REPLY_DELAY_US,
            timer_delay_ms: DEFAULT_TIMER_MS,
            current_timer_ms: DEFAULT_TIMER_MS,
            reset_period_ms: DEFAULT_RESET_MS,
            last_tick_ms: now,
            blink_tick: 0,
            last_activity_ms: now,
            filter_enabled: false,
            filter_window: DEFAULT_FILTER_WINDOW,
            tx_done: None,
            pending_tx: None,
            decode_errors: 0,
            #[cfg(feature = "exchange-data")]
            outbound_data: (0, 0),
        })
    }

    // ---- radio-context entry points ------------------------------------

    /// Hands a received frame to the engine. Intended for the host's
    /// radio-received callback; it classifies the frame, snapshots the
    /// radio's quality latches and enqueues, nothing more.
    pub fn radio_received(&mut self, frame: &[u8], rx_time: Timestamp) {
        let meta = match mac_frame::decode(frame) {
            Ok(meta) => meta,
            Err(_e) => {
                self.decode_errors = self.decode_errors.wrapping_add(1);
                uwb_debug!("dropping undecodable frame: {}", _e);
                return;
            }
        };
        match meta.dest {
            FrameDest::Short(dest) if dest != self.short_addr && !dest.is_broadcast() => return,
            FrameDest::Extended(dest) if dest != self.eui => return,
            _ => {}
        }
        let quality = RxQuality {
            rx_power_dbm: self.radio.last_rx_power_dbm(),
            first_path_power_dbm: self.radio.last_first_path_power_dbm(),
            receive_quality: self.radio.last_receive_quality(),
        };
        let now = self.host.now_ms();
        let Some(item) = RxFrame::new(frame, meta.src, meta.kind, rx_time, quality, now) else {
            self.decode_errors = self.decode_errors.wrapping_add(1);
            return;
        };
        if !self.intake.enqueue(item) {
            uwb_warn!("intake queue full, frame dropped");
            self.events.protocol_error(None, ErrorCode::IntakeOverflow);
        }
    }

    /// Reports a completed transmission. Intended for the host's
    /// transmit-done callback; only latches the timestamp.
    pub fn radio_sent(&mut self, tx_time: Timestamp) {
        self.tx_done = Some(tx_time);
    }

    // ---- service -------------------------------------------------------

    /// One cooperative slice of protocol work: consume the TX latch, drain
    /// the intake queue (bounded), run timeouts, prune, reset the receiver
    /// if the air has gone quiet, and, on a tag, tick the emitter.
    pub fn service_once(&mut self) -> Result<(), R::Error> {
        let now = self.host.now_ms();

        if let Some(ts) = self.tx_done.take() {
            self.handle_tx_complete(ts, now);
        }

        for _ in 0..INTAKE_QUEUE_SIZE {
            let Some(item) = self.intake.dequeue() else { break };
            self.dispatch(item, now)?;
        }

        self.check_protocol_timeouts(now);
        self.prune_inactive(now);
        self.check_global_reset(now)?;

        if self.role == Role::Tag {
            self.tick_emitter(now)?;
        }
        Ok(())
    }

    // ---- queries and tuning --------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn eui(&self) -> Eui {
        self.eui
    }

    pub fn short_address(&self) -> ShortAddress {
        self.short_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn find_peer(&self, short: ShortAddress) -> Option<&Peer> {
        self.peers.find(short)
    }

    /// The most recently added peer.
    pub fn get_last_peer(&self) -> Option<&Peer> {
        self.peers.last()
    }

    /// Frames dropped before dispatch (unparseable or oversized).
    pub fn decode_error_count(&self) -> u32 {
        self.decode_errors
    }

    pub fn set_reply_delay_us(&mut self, us: u16) {
        self.reply_delay_us = us;
    }

    pub fn set_reset_period_ms(&mut self, ms: u32) {
        self.reset_period_ms = ms;
    }

    pub fn set_timer_delay_ms(&mut self, ms: u32) {
        self.timer_delay_ms = ms;
        self.current_timer_ms = ms;
    }

    pub fn enable_range_filter(&mut self, enabled: bool) {
        self.filter_enabled = enabled;
    }

    /// Smoothing window; values below 2 clamp to 2.
    pub fn set_range_filter_window(&mut self, window: u16) {
        self.filter_window = window.max(crate::filter::MIN_FILTER_WINDOW);
    }

    /// Stages the `{dataType, dataValue}` pair appended to outgoing RANGE
    /// and RANGE_REPORT frames.
    #[cfg(feature = "exchange-data")]
    pub fn set_exchange_data(&mut self, data_kind: u32, data_value: u32) {
        self.outbound_data = (data_kind, data_value);
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    // ---- TX completion -------------------------------------------------

    fn handle_tx_complete(&mut self, ts: Timestamp, now: u64) {
        self.last_activity_ms = now;
        // A broadcast poll's departure time belongs to every peer, not to
        // whichever peer answers first.
        if self.pending_tx.take() == Some(MessageKind::Poll) {
            for peer in self.peers.iter_mut() {
                peer.times.poll_sent = ts;
                peer.note_protocol_activity(now);
            }
        }
    }

    // ---- dispatch ------------------------------------------------------

    fn dispatch(&mut self, item: RxFrame, now: u64) -> Result<(), R::Error> {
        self.last_activity_ms = now;

        // Discovery traffic creates peers and needs no table entry yet.
        match item.kind {
            MessageKind::Blink => {
                if self.role == Role::Anchor {
                    self.anchor_on_blink(&item, now)?;
                }
                return Ok(());
            }
            MessageKind::RangingInit => {
                if self.role == Role::Tag {
                    self.tag_on_ranging_init(&item, now);
                }
                return Ok(());
            }
            _ => {}
        }

        let Some(idx) = self.peers.position(item.src) else {
            uwb_debug!("frame from unknown peer {}", item.src.0);
            return Ok(());
        };
        self.peers[idx].note_seen(now);

        let expected = self.peers[idx].expected_next;
        let expected_matches = item.kind == expected;
        // POLL is exempt at an anchor: it legitimately restarts the exchange
        // from any state, including recovery after a failure.
        if !expected_matches && !(self.role == Role::Anchor && item.kind == MessageKind::Poll) {
            {
                let peer = &mut self.peers[idx];
                peer.protocol_failed = true;
                peer.state = PeerState::Failed;
                if self.role == Role::Tag {
                    peer.expected_next = MessageKind::PollAck;
                }
                peer.note_protocol_activity(now);
            }
            self.events
                .protocol_error(Some(&self.peers[idx]), ErrorCode::Unexpected(item.kind));
        }

        match (self.role, item.kind) {
            (Role::Anchor, MessageKind::Poll) => self.anchor_on_poll(idx, &item, now)?,
            // RANGE is processed even after a failure so the tag learns of
            // it through RANGE_FAILED rather than by timing out.
            (Role::Anchor, MessageKind::Range) => self.anchor_on_range(idx, &item, now)?,
            (Role::Tag, MessageKind::PollAck) if expected_matches => {
                self.tag_on_poll_ack(idx, &item, now)?
            }
            (Role::Tag, MessageKind::RangeReport) if expected_matches => {
                self.tag_on_range_report(idx, &item, now)
            }
            _ => {}
        }
        Ok(())
    }

    // ---- anchor side ---------------------------------------------------

    fn anchor_on_blink(&mut self, item: &RxFrame, now: u64) -> Result<(), R::Error> {
        let (eui, short) = match mac_frame::decode_blink(item.bytes()) {
            Ok(v) => v,
            Err(_) => {
                self.decode_errors = self.decode_errors.wrapping_add(1);
                return Ok(());
            }
        };
        if let Some(idx) = self.peers.position(short) {
            self.peers[idx].note_seen(now);
            return Ok(());
        }
        // One tag at a time: a new blink displaces whatever was tracked.
        self.peers.clear();
        match self.peers.add(Peer::new(short, eui, MessageKind::Poll, now)) {
            Ok(idx) => {
                self.transmit_ranging_init(&eui)?;
                self.events.blink_peer(&self.peers[idx]);
            }
            Err(_) => self.events.protocol_error(None, ErrorCode::TableFull),
        }
        Ok(())
    }

    fn anchor_on_poll(&mut self, idx: usize, item: &RxFrame, now: u64) -> Result<(), R::Error> {
        // POLL payload: count, then count × {short_addr: u16, reply_delay_us: u16}
        let payload = &item.bytes()[mac_frame::SHORT_MAC_LEN + 1..];
        let Some(&count) = payload.first() else {
            self.decode_errors = self.decode_errors.wrapping_add(1);
            return Ok(());
        };
        let count = count as usize;
        if payload.len() < 1 + count * 4 {
            self.decode_errors = self.decode_errors.wrapping_add(1);
            return Ok(());
        }
        let mut reply_delay = None;
        for i in 0..count {
            let off = 1 + i * 4;
            let short = ShortAddress::from_le_bytes(payload[off..off + 2].try_into().unwrap());
            if short == self.short_addr {
                reply_delay = Some(u16::from_le_bytes(
                    payload[off + 2..off + 4].try_into().unwrap(),
                ));
                break;
            }
        }
        // A broadcast poll that doesn't list us belongs to other anchors.
        let Some(delay) = reply_delay else {
            return Ok(());
        };

        {
            let peer = &mut self.peers[idx];
            peer.reset_protocol(now);
            peer.reply_delay_us = delay;
            peer.times.poll_received = item.rx_time;
            peer.expected_next = MessageKind::Range;
            peer.state = PeerState::PollSent;
        }
        let scheduled = self.radio.arm_delayed_tx(delay as u32)?;
        {
            let peer = &mut self.peers[idx];
            peer.times.poll_ack_sent = scheduled;
            peer.sent_ack = true;
        }
        self.transmit_short(item.src, MessageKind::PollAck)
    }

    fn anchor_on_range(&mut self, idx: usize, item: &RxFrame, now: u64) -> Result<(), R::Error> {
        {
            let peer = &mut self.peers[idx];
            peer.times.range_received = item.rx_time;
            peer.expected_next = MessageKind::Poll;
            peer.note_protocol_activity(now);
        }
        if self.peers[idx].protocol_failed {
            // The error callback already fired when the exchange broke.
            self.transmit_short(item.src, MessageKind::RangeFailed)?;
            self.peers[idx].state = PeerState::Failed;
            return Ok(());
        }
        self.peers[idx].state = PeerState::RangeSent;

        // RANGE payload: count, then count × {short: u16, t_poll_sent: 40,
        // t_poll_ack_received: 40, t_range_sent: 40}, all tag-clock values.
        let payload = &item.bytes()[mac_frame::SHORT_MAC_LEN + 1..];
        let Some(&count) = payload.first() else {
            self.decode_errors = self.decode_errors.wrapping_add(1);
            return Ok(());
        };
        let count = count as usize;
        if payload.len() < 1 + count * 17 {
            self.decode_errors = self.decode_errors.wrapping_add(1);
            return Ok(());
        }
        let mut triplet = None;
        for i in 0..count {
            let off = 1 + i * 17;
            let short = ShortAddress::from_le_bytes(payload[off..off + 2].try_into().unwrap());
            if short == self.short_addr {
                triplet = Some((
                    Timestamp::from_le_bytes(payload[off + 2..off + 7].try_into().unwrap()),
                    Timestamp::from_le_bytes(payload[off + 7..off + 12].try_into().unwrap()),
                    Timestamp::from_le_bytes(payload[off + 12..off + 17].try_into().unwrap()),
                ));
                break;
            }
        }
        let Some((t_poll_sent, t_poll_ack_received, t_range_sent)) = triplet else {
            return Ok(());
        };
        #[cfg(feature = "exchange-data")]
        if payload.len() >= 1 + count * 17 + 8 {
            let off = 1 + count * 17;
            self.peers[idx].exchange_data = Some((
                u32::from_le_bytes(payload[off..off + 4].try_into().unwrap()),
                u32::from_le_bytes(payload[off + 4..off + 8].try_into().unwrap()),
            ));
        }

        let (round1, reply1, round2, reply2) = {
            let peer = &mut self.peers[idx];
            peer.times.poll_sent = t_poll_sent;
            peer.times.poll_ack_received = t_poll_ack_received;
            peer.times.range_sent = t_range_sent;
            let t = &peer.times;
            (
                t.poll_ack_received.wrapping_sub(t.poll_sent).as_ticks() as i64,
                t.poll_ack_sent.wrapping_sub(t.poll_received).as_ticks() as i64,
                t.range_received.wrapping_sub(t.poll_ack_sent).as_ticks() as i64,
                t.range_sent.wrapping_sub(t.poll_ack_received).as_ticks() as i64,
            )
        };

        match asymmetric_tof(round1, reply1, round2, reply2) {
            Some(tof_ticks) => {
                let mut range = time::ticks_to_meters(tof_ticks);
                if self.filter_enabled {
                    range = self.peers[idx].filter.apply(range, self.filter_window);
                }
                let quality = item.quality;
                {
                    let peer = &mut self.peers[idx];
                    peer.range_m = range;
                    peer.rx_power_dbm = quality.rx_power_dbm;
                    peer.first_path_power_dbm = quality.first_path_power_dbm;
                    peer.receive_quality = quality.receive_quality;
                    peer.state = PeerState::RangeReportSent;
                }
                self.transmit_range_report(item.src, range, quality.rx_power_dbm)?;
                self.events.range_complete(&self.peers[idx]);
            }
            None => {
                uwb_warn!("invalid TWR arithmetic for peer {}", item.src.0);
                self.transmit_short(item.src, MessageKind::RangeFailed)?;
                {
                    let peer = &mut self.peers[idx];
                    peer.protocol_failed = true;
                    peer.state = PeerState::Failed;
                }
                self.events
                    .protocol_error(Some(&self.peers[idx]), ErrorCode::RangingFailed);
            }
        }
        Ok(())
    }

    // ---- tag side ------------------------------------------------------

    fn tag_on_ranging_init(&mut self, item: &RxFrame, now: u64) {
        if let Some(idx) = self.peers.position(item.src) {
            self.peers[idx].note_seen(now);
            return;
        }
        // RANGING_INIT carries no anchor EUI; the short address is all a
        // tag ever learns about an anchor.
        let peer = Peer::new(item.src, Eui::default(), MessageKind::PollAck, now);
        match self.peers.add(peer) {
            Ok(idx) => self.events.new_peer(&self.peers[idx]),
            Err(AddError::Full) => self.events.protocol_error(None, ErrorCode::TableFull),
            Err(AddError::DuplicateShortAddress) => {}
        }
    }

    fn tag_on_poll_ack(&mut self, idx: usize, item: &RxFrame, now: u64) -> Result<(), R::Error> {
        {
            let peer = &mut self.peers[idx];
            peer.times.poll_ack_received = item.rx_time;
            peer.received_ack = true;
            peer.state = PeerState::PollAckSent;
            peer.note_protocol_activity(now);
        }
        // The reply slots stagger the acks, but nothing is lost by accepting
        // them in any order: broadcast RANGE once the set is complete.
        if self.peers.iter().all(|p| p.received_ack) {
            self.tag_transmit_range(now)?;
        }
        Ok(())
    }

    fn tag_on_range_report(&mut self, idx: usize, item: &RxFrame, now: u64) {
        // RANGE_REPORT payload: range_m: f32, rx_power_dbm: f32
        let payload = &item.bytes()[mac_frame::SHORT_MAC_LEN + 1..];
        if payload.len() < 8 {
            self.decode_errors = self.decode_errors.wrapping_add(1);
            return;
        }
        let mut range = f32::from_le_bytes(payload[0..4].try_into().unwrap());
        let rx_power = f32::from_le_bytes(payload[4..8].try_into().unwrap());
        #[cfg(feature = "exchange-data")]
        if payload.len() >= 16 {
            self.peers[idx].exchange_data = Some((
                u32::from_le_bytes(payload[8..12].try_into().unwrap()),
                u32::from_le_bytes(payload[12..16].try_into().unwrap()),
            ));
        }
        if self.filter_enabled {
            range = self.peers[idx].filter.apply(range, self.filter_window);
        }
        let quality = item.quality;
        {
            let peer = &mut self.peers[idx];
            peer.range_m = range;
            peer.rx_power_dbm = rx_power;
            peer.first_path_power_dbm = quality.first_path_power_dbm;
            peer.receive_quality = quality.receive_quality;
            peer.state = PeerState::Idle;
            peer.expected_next = MessageKind::PollAck;
            peer.note_protocol_activity(now);
        }
        self.events.new_range();
        self.events.range_complete(&self.peers[idx]);
    }

    // ---- emission ------------------------------------------------------

    fn tick_emitter(&mut self, now: u64) -> Result<(), R::Error> {
        if now.saturating_sub(self.last_tick_ms) < self.current_timer_ms as u64 {
            return Ok(());
        }
        self.last_tick_ms = now;
        self.blink_tick = (self.blink_tick + 1) % BLINK_PERIOD_TICKS;
        if self.peers.is_empty() || self.blink_tick == 0 {
            self.transmit_blink()
        } else {
            self.tag_transmit_poll(now)
        }
    }

    fn transmit_blink(&mut self) -> Result<(), R::Error> {
        let seq = self.next_seq();
        let mut buf = [0u8; FRAME_BUF_LEN];
        let n = mac_frame::encode_blink(&mut buf, seq, &self.eui, self.short_addr);
        self.radio.transmit(&buf[..n])?;
        self.pending_tx = Some(MessageKind::Blink);
        Ok(())
    }

    fn tag_transmit_poll(&mut self, now: u64) -> Result<(), R::Error> {
        let seq = self.next_seq();
        let mut buf = [0u8; FRAME_BUF_LEN];
        let mut n = mac_frame::encode_short_mac(
            &mut buf,
            seq,
            self.pan_id,
            ShortAddress::BROADCAST,
            self.short_addr,
            MessageKind::Poll,
        );
        buf[n] = self.peers.len() as u8;
        n += 1;
        let base = self.reply_delay_us as u32;
        for (i, peer) in self.peers.iter_mut().enumerate() {
            // Slot i answers (2i + 1) reply delays after the poll.
            let delay = ((2 * i as u32 + 1) * base).min(u16::MAX as u32) as u16;
            peer.reset_protocol(now);
            peer.reply_delay_us = delay;
            peer.expected_next = MessageKind::PollAck;
            buf[n..n + 2].copy_from_slice(&peer.short_address.to_le_bytes());
            buf[n + 2..n + 4].copy_from_slice(&delay.to_le_bytes());
            n += 4;
        }
        self.radio.transmit(&buf[..n])?;
        self.pending_tx = Some(MessageKind::Poll);
        // Leave room for every ack slot before the next round.
        self.current_timer_ms =
            self.timer_delay_ms + self.peers.len() as u32 * 3 * self.reply_delay_us as u32 / 1000;
        self.last_activity_ms = now;
        Ok(())
    }

    fn tag_transmit_range(&mut self, now: u64) -> Result<(), R::Error> {
        // Arm first: the payload embeds the scheduled departure time.
        let scheduled = self.radio.arm_delayed_tx(self.reply_delay_us as u32)?;
        let seq = self.next_seq();
        let mut buf = [0u8; FRAME_BUF_LEN];
        let mut n = mac_frame::encode_short_mac(
            &mut buf,
            seq,
            self.pan_id,
            ShortAddress::BROADCAST,
            self.short_addr,
            MessageKind::Range,
        );
        buf[n] = self.peers.len() as u8;
        n += 1;
        for peer in self.peers.iter_mut() {
            peer.times.range_sent = scheduled;
            peer.expected_next = MessageKind::RangeReport;
            peer.note_protocol_activity(now);
            buf[n..n + 2].copy_from_slice(&peer.short_address.to_le_bytes());
            buf[n + 2..n + 7].copy_from_slice(&peer.times.poll_sent.to_le_bytes());
            buf[n + 7..n + 12].copy_from_slice(&peer.times.poll_ack_received.to_le_bytes());
            buf[n + 12..n + 17].copy_from_slice(&scheduled.to_le_bytes());
            n += 17;
        }
        #[cfg(feature = "exchange-data")]
        {
            buf[n..n + 4].copy_from_slice(&self.outbound_data.0.to_le_bytes());
            buf[n + 4..n + 8].copy_from_slice(&self.outbound_data.1.to_le_bytes());
            n += 8;
        }
        self.radio.transmit(&buf[..n])?;
        self.pending_tx = Some(MessageKind::Range);
        self.last_activity_ms = now;
        Ok(())
    }

    fn transmit_ranging_init(&mut self, dest: &Eui) -> Result<(), R::Error> {
        let seq = self.next_seq();
        let mut buf = [0u8; FRAME_BUF_LEN];
        let n = mac_frame::encode_ranging_init(&mut buf, seq, self.pan_id, dest, self.short_addr);
        self.radio.transmit(&buf[..n])?;
        self.pending_tx = Some(MessageKind::RangingInit);
        Ok(())
    }

    /// Header-only unicast (POLL_ACK, RANGE_FAILED).
    fn transmit_short(&mut self, dest: ShortAddress, kind: MessageKind) -> Result<(), R::Error> {
        let seq = self.next_seq();
        let mut buf = [0u8; FRAME_BUF_LEN];
        let n = mac_frame::encode_short_mac(&mut buf, seq, self.pan_id, dest, self.short_addr, kind);
        self.radio.transmit(&buf[..n])?;
        self.pending_tx = Some(kind);
        Ok(())
    }

    fn transmit_range_report(
        &mut self,
        dest: ShortAddress,
        range_m: f32,
        rx_power_dbm: f32,
    ) -> Result<(), R::Error> {
        let seq = self.next_seq();
        let mut buf = [0u8; FRAME_BUF_LEN];
        let mut n = mac_frame::encode_short_mac(
            &mut buf,
            seq,
            self.pan_id,
            dest,
            self.short_addr,
            MessageKind::RangeReport,
        );
        buf[n..n + 4].copy_from_slice(&range_m.to_le_bytes());
        buf[n + 4..n + 8].copy_from_slice(&rx_power_dbm.to_le_bytes());
        n += 8;
        #[cfg(feature = "exchange-data")]
        {
            buf[n..n + 4].copy_from_slice(&self.outbound_data.0.to_le_bytes());
            buf[n + 4..n + 8].copy_from_slice(&self.outbound_data.1.to_le_bytes());
            n += 8;
        }
        self.radio.transmit(&buf[..n])?;
        self.pending_tx = Some(MessageKind::RangeReport);
        Ok(())
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    // ---- housekeeping --------------------------------------------------

    fn check_protocol_timeouts(&mut self, now: u64) {
        let fallback = match self.role {
            Role::Anchor => MessageKind::Poll,
            Role::Tag => MessageKind::PollAck,
        };
        for idx in 0..self.peers.len() {
            let age = now.saturating_sub(self.peers[idx].last_protocol_activity_ms);
            let expired = self.peers[idx].is_protocol_timed_out(now)
                || (self.peers[idx].state != PeerState::Idle
                    && age > HARD_PROTOCOL_TIMEOUT_MS as u64);
            if expired {
                uwb_warn!("protocol timeout for peer {}", self.peers[idx].short_address.0);
                {
                    let peer = &mut self.peers[idx];
                    peer.reset_protocol(now);
                    peer.expected_next = fallback;
                }
                self.events
                    .protocol_error(Some(&self.peers[idx]), ErrorCode::Timeout);
            }
        }
    }

    fn prune_inactive(&mut self, now: u64) {
        let mut idx = 0;
        while idx < self.peers.len() {
            if now.saturating_sub(self.peers[idx].last_seen_ms) > INACTIVITY_MS as u64 {
                let removed = self.peers.remove(idx);
                uwb_debug!("pruning inactive peer {}", removed.short_address.0);
                self.events.inactive_peer(&removed);
            } else {
                idx += 1;
            }
        }
    }

    /// With nothing mid-flight and the air quiet past the reset period,
    /// put every peer back to expecting POLL and re-arm the receiver. Never
    /// fires during a live exchange.
    fn check_global_reset(&mut self, now: u64) -> Result<(), R::Error> {
        if self.peers.iter().any(|p| p.is_protocol_active()) {
            return Ok(());
        }
        if now.saturating_sub(self.last_activity_ms) <= self.reset_period_ms as u64 {
            return Ok(());
        }
        for peer in self.peers.iter_mut() {
            peer.expected_next = MessageKind::Poll;
        }
        self.radio.start_receive()?;
        self.last_activity_ms = now;
        Ok(())
    }
}

/// Asymmetric double-sided TWR.
///
/// The four legs are 40-bit tick spans, so a product of two legs needs up
/// to 80 bits; a `reply_delay_us` in the tens of milliseconds already
/// pushes `round1 * round2` past `i64::MAX`. The multiplications therefore
/// happen in i128, and only the quotient (bounded by a single leg, < 2⁴⁰)
/// narrows back down. `None` when the arithmetic cannot describe a
/// physical flight (zero denominator or negative numerator), which the
/// caller answers with RANGE_FAILED.
fn asymmetric_tof(round1: i64, reply1: i64, round2: i64, reply2: i64) -> Option<u64> {
    let (round1, reply1, round2, reply2) = (
        round1 as i128,
        reply1 as i128,
        round2 as i128,
        reply2 as i128,
    );
    let denom = round1 + round2 + reply1 + reply2;
    if denom <= 0 {
        return None;
    }
    let num = round1 * round2 - reply1 * reply2;
    if num < 0 {
        return None;
    }
    Some((num / denom) as u64)
}
