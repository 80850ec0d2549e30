// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Filter creation contract. Clients ship a kind tag plus a small block of
// f32 parameters; the server regenerates the impulse response
// deterministically from those inputs and parks the resulting GPU handle in
// a slot table, so pipeline stages only ever reference the slot id.

use std::f64::consts::PI;

/// Closed set of filter kinds a client may request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Kaiser = 0,
    MatchedChirp = 1,
}

impl FilterKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Kaiser,
            1 => Self::MatchedChirp,
            _ => return None,
        })
    }
}

/// Number of f32 values in each kind-specific parameter struct.
pub const FILTER_PARAMETER_COUNT: usize = 3;

/// Kaiser-windowed low-pass FIR design inputs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KaiserParameters {
    pub beta: f32,
    pub cutoff_frequency: f32,
    /// Tap count, carried as f32 like the rest of the wire block.
    pub length: f32,
}

/// Linear-FM matched filter design inputs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MatchedChirpParameters {
    pub duration: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union FilterKindParameters {
    pub kaiser: KaiserParameters,
    pub matched_chirp: MatchedChirpParameters,
    pub raw: [f32; FILTER_PARAMETER_COUNT],
}

/// Wire block accompanying a CreateFilter work item.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FilterParameters {
    pub kind_parameters: FilterKindParameters,
    pub sampling_frequency: f32,
    /// Nonzero when the response is complex (interleaved re/im taps).
    pub complex: u16,
    pub _pad: u16,
}

const _: () = assert!(std::mem::size_of::<FilterParameters>() == 20);

impl FilterParameters {
    pub fn kaiser(parameters: KaiserParameters, sampling_frequency: f32, complex: bool) -> Self {
        Self {
            kind_parameters: FilterKindParameters { kaiser: parameters },
            sampling_frequency,
            complex: complex as u16,
            _pad: 0,
        }
    }

    pub fn matched_chirp(
        parameters: MatchedChirpParameters,
        sampling_frequency: f32,
        complex: bool,
    ) -> Self {
        Self {
            kind_parameters: FilterKindParameters {
                matched_chirp: parameters,
            },
            sampling_frequency,
            complex: complex as u16,
            _pad: 0,
        }
    }

    /// Build from the raw f32 sequence of the wire contract. `values` must
    /// contain exactly [`FILTER_PARAMETER_COUNT`] entries.
    pub fn from_raw(values: &[f32], sampling_frequency: f32, complex: bool) -> Option<Self> {
        if values.len() != FILTER_PARAMETER_COUNT {
            return None;
        }
        let mut raw = [0.0f32; FILTER_PARAMETER_COUNT];
        raw.copy_from_slice(values);
        Some(Self {
            kind_parameters: FilterKindParameters { raw },
            sampling_frequency,
            complex: complex as u16,
            _pad: 0,
        })
    }

    pub fn is_complex(&self) -> bool {
        self.complex != 0
    }
}

/// Regenerate the impulse response for a filter request. Real responses are
/// one f32 per tap; complex responses interleave re/im.
pub fn impulse_response(kind: FilterKind, parameters: &FilterParameters) -> Vec<f32> {
    match kind {
        FilterKind::Kaiser => kaiser_low_pass(parameters),
        FilterKind::MatchedChirp => matched_chirp(parameters),
    }
}

/// Zeroth-order modified Bessel function of the first kind, by power series.
fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut sum = 1.0;
    let mut term = 1.0;
    for k in 1..64 {
        let f = half / k as f64;
        term *= f * f;
        sum += term;
        if term < sum * 1e-12 {
            break;
        }
    }
    sum
}

fn kaiser_low_pass(parameters: &FilterParameters) -> Vec<f32> {
    let design = unsafe { parameters.kind_parameters.kaiser };
    let taps = design.length.round().max(1.0) as usize;
    let fs = parameters.sampling_frequency as f64;
    let beta = design.beta as f64;
    // Normalized cutoff in cycles per sample.
    let w = 2.0 * design.cutoff_frequency as f64 / fs;
    let centre = (taps as f64 - 1.0) / 2.0;
    let i0_beta = bessel_i0(beta);

    let mut response = Vec::with_capacity(if parameters.is_complex() {
        2 * taps
    } else {
        taps
    });
    for n in 0..taps {
        let x = n as f64 - centre;
        let sinc = if x == 0.0 {
            1.0
        } else {
            (PI * w * x).sin() / (PI * w * x)
        };
        let window = if taps == 1 {
            1.0
        } else {
            let r = 2.0 * n as f64 / (taps as f64 - 1.0) - 1.0;
            bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / i0_beta
        };
        let tap = (w * sinc * window) as f32;
        response.push(tap);
        if parameters.is_complex() {
            response.push(0.0);
        }
    }
    response
}

fn matched_chirp(parameters: &FilterParameters) -> Vec<f32> {
    let design = unsafe { parameters.kind_parameters.matched_chirp };
    let fs = parameters.sampling_frequency as f64;
    let taps = (design.duration as f64 * fs).round().max(1.0) as usize;
    let slope = if design.duration != 0.0 {
        (design.max_frequency as f64 - design.min_frequency as f64) / design.duration as f64
    } else {
        0.0
    };
    let scale = 1.0 / taps as f64;

    let mut response = Vec::with_capacity(if parameters.is_complex() {
        2 * taps
    } else {
        taps
    });
    for n in 0..taps {
        // Matched filter: conjugate of the time-reversed transmit chirp.
        let t = (taps - 1 - n) as f64 / fs;
        let phase = 2.0 * PI * (design.min_frequency as f64 * t + 0.5 * slope * t * t);
        response.push((phase.cos() * scale) as f32);
        if parameters.is_complex() {
            response.push((-phase.sin() * scale) as f32);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bessel_i0_at_zero_is_one() {
        assert!((bessel_i0(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn kaiser_response_is_deterministic() {
        let p = FilterParameters::kaiser(
            KaiserParameters {
                beta: 5.65,
                cutoff_frequency: 2.0e6,
                length: 36.0,
            },
            20.0e6,
            false,
        );
        let a = impulse_response(FilterKind::Kaiser, &p);
        let b = impulse_response(FilterKind::Kaiser, &p);
        assert_eq!(a.len(), 36);
        assert_eq!(a, b);
    }

    #[test]
    fn kaiser_response_is_symmetric() {
        let p = FilterParameters::kaiser(
            KaiserParameters {
                beta: 4.0,
                cutoff_frequency: 1.0e6,
                length: 21.0,
            },
            10.0e6,
            false,
        );
        let h = impulse_response(FilterKind::Kaiser, &p);
        for i in 0..h.len() / 2 {
            assert!(
                (h[i] - h[h.len() - 1 - i]).abs() < 1e-6,
                "tap {i} not symmetric"
            );
        }
        // Peak at the centre.
        let peak = h.iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(h[h.len() / 2], peak);
    }

    #[test]
    fn complex_response_interleaves() {
        let p = FilterParameters::matched_chirp(
            MatchedChirpParameters {
                duration: 2.0e-6,
                min_frequency: 1.0e6,
                max_frequency: 3.0e6,
            },
            20.0e6,
            true,
        );
        let h = impulse_response(FilterKind::MatchedChirp, &p);
        assert_eq!(h.len(), 2 * 40);
    }

    #[test]
    fn raw_wire_block_round_trips() {
        let p = FilterParameters::from_raw(&[5.65, 2.0e6, 36.0], 20.0e6, false).unwrap();
        let k = unsafe { p.kind_parameters.kaiser };
        assert_eq!(k.beta, 5.65);
        assert_eq!(k.cutoff_frequency, 2.0e6);
        assert_eq!(k.length, 36.0);
        assert!(FilterParameters::from_raw(&[1.0], 1.0, false).is_none());
    }
}
