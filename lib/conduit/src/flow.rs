use crate::buffer::BUF_SIZE;
use lazy_static::lazy_static;
use std::sync::Mutex;

/// Default per-message high watermark, in buffers. A message whose chain
/// grows strictly past this stops the producing link.
pub const Q2_UPPER_DEFAULT: usize = 64;

/// Default per-message low watermark, in buffers. Shrinking to or below this
/// releases the producer.
pub const Q2_LOWER_DEFAULT: usize = 32;

/// Default per-session high watermark, in buffers of pending outgoing data
/// across all links of the session.
pub const Q3_UPPER_DEFAULT: usize = 2 * (2 * Q2_UPPER_DEFAULT);

/// Default per-session low watermark.
pub const Q3_LOWER_DEFAULT: usize = Q3_UPPER_DEFAULT / 2;

/// Watermark overrides. Applied once at startup, before any session or
/// message exists.
#[derive(Debug, Copy, Clone)]
pub struct FlowTuning {
    pub q2_upper: usize,
    pub q2_lower: usize,
    pub q3_upper: usize,
    pub q3_lower: usize,
}

impl Default for FlowTuning {
    fn default() -> FlowTuning {
        FlowTuning {
            q2_upper: Q2_UPPER_DEFAULT,
            q2_lower: Q2_LOWER_DEFAULT,
            q3_upper: Q3_UPPER_DEFAULT,
            q3_lower: Q3_LOWER_DEFAULT,
        }
    }
}

impl FlowTuning {
    /// Q3 watermarks are configured in buffers but accounted in octets.
    #[inline]
    pub fn q3_upper_octets(&self) -> u64 {
        (self.q3_upper * BUF_SIZE) as u64
    }

    #[inline]
    pub fn q3_lower_octets(&self) -> u64 {
        (self.q3_lower * BUF_SIZE) as u64
    }
}

lazy_static! {
    static ref TUNING: Mutex<FlowTuning> = Mutex::new(FlowTuning::default());
}

/// Installs watermark overrides. Call during single-threaded startup only.
pub fn tune_flow(tuning: FlowTuning) {
    if tuning.q2_lower >= tuning.q2_upper || tuning.q3_lower >= tuning.q3_upper {
        panic!("Flow watermarks must satisfy lower < upper");
    }

    *TUNING.lock().expect("Flow tuning lock poisoned") = tuning;
}

#[inline]
pub fn flow_tuning() -> FlowTuning {
    *TUNING.lock().expect("Flow tuning lock poisoned")
}

/// Q2 block predicate. Evaluated with the content lock held.
#[inline]
pub fn q2_should_block(buf_count: usize, q2_enabled: bool, tuning: &FlowTuning) -> bool {
    q2_enabled && buf_count > tuning.q2_upper
}

/// Q2 unblock predicate. Evaluated with the content lock held.
#[inline]
pub fn q2_should_unblock(buf_count: usize, tuning: &FlowTuning) -> bool {
    buf_count <= tuning.q2_lower
}
