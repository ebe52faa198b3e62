//! Direct-addressed jitter buffer for RTP reordering and loss recovery.
//!
//! Grounded on `original_source/core/jitter_buffer.c`'s slot table
//! (`seq mod slots`), adapted to a `parking_lot::Mutex`-guarded struct
//! in the shape of `bass-aes67/src/input/jitter.rs::JitterStats`
//! rather than that file's sorted-`VecDeque` algorithm.

use crate::error::AudynError;
use parking_lot::Mutex;

const SEQ_MAX_DELTA: i32 = 1000;
const MAX_PAYLOAD: usize = 1152;
const NS_PER_MS: u64 = 1_000_000;

fn seq_compare(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

#[derive(Clone)]
struct Slot {
    valid: bool,
    seq: u16,
    rtp_ts: u32,
    arrival_ptp_ns: u64,
    payload_len: usize,
    payload: [u8; MAX_PAYLOAD],
}

impl Slot {
    fn empty() -> Self {
        Self {
            valid: false,
            seq: 0,
            rtp_ts: 0,
            arrival_ptp_ns: 0,
            payload_len: 0,
            payload: [0u8; MAX_PAYLOAD],
        }
    }
}

/// A packet handed back by [`JitterBuffer::get`].
pub struct JitterPacket {
    pub seq: u16,
    pub rtp_ts: u32,
    pub arrival_ptp_ns: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JitterStats {
    pub packets_received: u64,
    pub packets_played: u64,
    pub packets_late: u64,
    pub packets_lost: u64,
    pub packets_reordered: u64,
    pub buffer_overflows: u64,
    pub stream_restarts: u64,
    pub current_depth: u32,
    pub max_depth: u32,
}

pub struct JitterConfig {
    pub sample_rate: u32,
    pub samples_per_packet: u32,
    pub depth_ms: u32,
}

struct State {
    initialized: bool,
    next_seq: u16,
    highest_seq: u16,
    playout_time_ns: u64,
    stats: JitterStats,
    slots: Vec<Slot>,
}

/// Sequence-addressed, depth-bounded packet reorder buffer.
pub struct JitterBuffer {
    buffer_size: u32,
    loss_threshold: i32,
    packet_duration_ns: u64,
    depth_ms: u32,
    state: Mutex<State>,
}

impl JitterBuffer {
    pub fn new(cfg: &JitterConfig) -> Self {
        assert!(cfg.sample_rate > 0 && cfg.samples_per_packet > 0 && cfg.depth_ms > 0);

        let packets_per_ms =
            (cfg.sample_rate / (cfg.samples_per_packet * 1000)).max(1);

        let mut buffer_size = packets_per_ms * cfg.depth_ms * 2;
        buffer_size = buffer_size.clamp(16, 1024);

        let mut loss_threshold = (packets_per_ms * cfg.depth_ms * 2) as i32;
        if loss_threshold < 4 {
            loss_threshold = 4;
        }

        let packet_duration_ns =
            cfg.samples_per_packet as u64 * 1_000_000_000 / cfg.sample_rate as u64;

        Self {
            buffer_size,
            loss_threshold,
            packet_duration_ns,
            depth_ms: cfg.depth_ms,
            state: Mutex::new(State {
                initialized: false,
                next_seq: 0,
                highest_seq: 0,
                playout_time_ns: 0,
                stats: JitterStats::default(),
                slots: vec![Slot::empty(); buffer_size as usize],
            }),
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.buffer_size
    }

    fn seq_to_index(&self, seq: u16) -> usize {
        (seq as u32 % self.buffer_size) as usize
    }

    /// Inserts a received packet. `payload` must be `<= 1152` bytes
    /// (the maximum framed AES67 payload this buffer accepts).
    pub fn insert(&self, seq: u16, rtp_ts: u32, arrival_ns: u64, payload: &[u8]) -> Result<(), ()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(());
        }

        let mut s = self.state.lock();
        s.stats.packets_received += 1;

        if !s.initialized {
            s.next_seq = seq;
            s.highest_seq = seq;
            s.playout_time_ns = arrival_ns + self.depth_ms as u64 * NS_PER_MS;
            s.initialized = true;
        }

        let delta_from_next = seq_compare(seq, s.next_seq);
        if delta_from_next < 0 {
            if delta_from_next > -SEQ_MAX_DELTA {
                s.stats.packets_late += 1;
                return Ok(());
            } else {
                let err = AudynError::StreamRestart(format!(
                    "large backward sequence jump (seq={seq}, expected={}); resetting and reanchoring",
                    s.next_seq
                ));
                log::warn!("jitter: {err}");
                s.stats.stream_restarts += 1;
                self.reset_unlocked(&mut s);
                s.next_seq = seq;
                s.highest_seq = seq;
                s.playout_time_ns = arrival_ns + self.depth_ms as u64 * NS_PER_MS;
                s.initialized = true;
            }
        }

        let delta_from_highest = seq_compare(seq, s.highest_seq);
        if delta_from_highest < 0 && delta_from_highest > -SEQ_MAX_DELTA {
            s.stats.packets_reordered += 1;
        } else if delta_from_highest > 0 {
            s.highest_seq = seq;
        }

        let delta_ahead = seq_compare(seq, s.next_seq);
        if delta_ahead >= self.buffer_size as i32 {
            let advance_count = (delta_ahead - self.buffer_size as i32 + 1) as u32;
            for _ in 0..advance_count {
                let skip_index = self.seq_to_index(s.next_seq);
                let skip_seq = s.next_seq;
                let still_valid = s.slots[skip_index].valid && s.slots[skip_index].seq == skip_seq;
                if !still_valid {
                    s.stats.packets_lost += 1;
                }
                s.slots[skip_index].valid = false;
                s.next_seq = s.next_seq.wrapping_add(1);
                s.playout_time_ns += self.packet_duration_ns;
            }
            s.stats.buffer_overflows += 1;
        }

        let index = self.seq_to_index(seq);
        let already_same = s.slots[index].valid && s.slots[index].seq == seq;
        if already_same {
            return Ok(());
        }
        if s.slots[index].valid {
            s.stats.packets_lost += 1;
        }

        let mut buf = [0u8; MAX_PAYLOAD];
        buf[..payload.len()].copy_from_slice(payload);
        s.slots[index] = Slot {
            valid: true,
            seq,
            rtp_ts,
            arrival_ptp_ns: arrival_ns,
            payload_len: payload.len(),
            payload: buf,
        };

        let depth = (seq_compare(s.highest_seq, s.next_seq) + 1).max(0) as u32;
        s.stats.current_depth = depth;
        if depth > s.stats.max_depth {
            s.stats.max_depth = depth;
        }

        Ok(())
    }

    /// Returns the packet whose sequence equals `next_seq`, or `None`
    /// if it has not arrived yet (and has not been declared lost).
    pub fn get(&self) -> Option<JitterPacket> {
        let mut s = self.state.lock();
        if !s.initialized {
            return None;
        }

        let index = self.seq_to_index(s.next_seq);
        if s.slots[index].valid && s.slots[index].seq == s.next_seq {
            let slot = s.slots[index].clone();
            s.slots[index].valid = false;
            s.next_seq = s.next_seq.wrapping_add(1);
            s.playout_time_ns += self.packet_duration_ns;
            s.stats.packets_played += 1;

            let depth = (seq_compare(s.highest_seq, s.next_seq) + 1).max(0) as u32;
            s.stats.current_depth = depth;

            return Some(JitterPacket {
                seq: slot.seq,
                rtp_ts: slot.rtp_ts,
                arrival_ptp_ns: slot.arrival_ptp_ns,
                payload: slot.payload[..slot.payload_len].to_vec(),
            });
        }

        let gap = seq_compare(s.highest_seq, s.next_seq);
        if gap > self.loss_threshold {
            s.stats.packets_lost += 1;
            s.next_seq = s.next_seq.wrapping_add(1);
            s.playout_time_ns += self.packet_duration_ns;
        }

        None
    }

    /// Whether the caller should invoke `get` now: either the expected
    /// packet has arrived or the playout deadline for it has passed.
    pub fn ready(&self, current_ns: u64) -> bool {
        let s = self.state.lock();
        if !s.initialized || current_ns < s.playout_time_ns {
            return false;
        }

        let index = self.seq_to_index(s.next_seq);
        if s.slots[index].valid && s.slots[index].seq == s.next_seq {
            return true;
        }

        seq_compare(s.highest_seq, s.next_seq) > self.loss_threshold
    }

    pub fn reset(&self) {
        let mut s = self.state.lock();
        self.reset_unlocked(&mut s);
    }

    fn reset_unlocked(&self, s: &mut State) {
        for slot in s.slots.iter_mut() {
            slot.valid = false;
        }
        s.initialized = false;
        s.next_seq = 0;
        s.highest_seq = 0;
        s.playout_time_ns = 0;
        s.stats.current_depth = 0;
    }

    pub fn stats(&self) -> JitterStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jb() -> JitterBuffer {
        JitterBuffer::new(&JitterConfig {
            sample_rate: 48000,
            samples_per_packet: 48,
            depth_ms: 20,
        })
    }

    #[test]
    fn slot_count_is_clamped_into_range() {
        let b = jb();
        assert!(b.slot_count() >= 16 && b.slot_count() <= 1024);
    }

    #[test]
    fn in_order_packets_play_back_in_order() {
        let b = jb();
        for seq in 0u16..5 {
            b.insert(seq, seq as u32 * 48, seq as u64 * 1_000_000, &[0u8; 4])
                .unwrap();
        }
        for seq in 0u16..5 {
            let p = b.get().unwrap();
            assert_eq!(p.seq, seq);
        }
        assert_eq!(b.stats().packets_played, 5);
    }

    #[test]
    fn reordered_packet_is_counted_and_still_plays() {
        let b = jb();
        b.insert(0, 0, 0, &[0u8; 4]).unwrap();
        b.insert(2, 96, 2_000_000, &[0u8; 4]).unwrap();
        b.insert(1, 48, 1_000_000, &[0u8; 4]).unwrap();

        assert_eq!(b.stats().packets_reordered, 1);
        assert_eq!(b.get().unwrap().seq, 0);
        assert_eq!(b.get().unwrap().seq, 1);
        assert_eq!(b.get().unwrap().seq, 2);
    }

    #[test]
    fn late_packet_behind_next_seq_is_rejected() {
        let b = jb();
        b.insert(5, 0, 0, &[0u8; 4]).unwrap();
        let _ = b.get(); // consumes seq 5, next_seq advances to 6
        b.insert(4, 0, 0, &[0u8; 4]).unwrap();
        assert_eq!(b.stats().packets_late, 1);
    }

    #[test]
    fn large_backward_jump_resets_and_reanchors() {
        let b = jb();
        b.insert(5000, 0, 0, &[0u8; 4]).unwrap();
        b.insert(10, 0, 0, &[0u8; 4]).unwrap();
        assert_eq!(b.get().unwrap().seq, 10);
        assert_eq!(b.stats().stream_restarts, 1);
    }

    #[test]
    fn duplicate_packet_is_silently_dropped() {
        let b = jb();
        b.insert(1, 0, 0, &[1u8; 4]).unwrap();
        b.insert(1, 0, 0, &[2u8; 4]).unwrap();
        assert_eq!(b.stats().packets_received, 2);
        let p = b.get().unwrap();
        assert_eq!(p.payload, vec![1u8; 4]);
    }

    #[test]
    fn payload_over_max_is_rejected() {
        let b = jb();
        let oversize = vec![0u8; MAX_PAYLOAD + 1];
        assert!(b.insert(1, 0, 0, &oversize).is_err());
    }
}
