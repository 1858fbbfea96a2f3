//! Flip-flop label encoding.
//!
//! A flip-flop code doubles the base alphabet: each base `b` has a flip
//! state `b` and a flop state `b + nbase`. Consecutive identical bases
//! alternate between the two, so no two adjacent labels are ever equal and
//! the transition loss needs no blank symbol to separate repeats.

use crate::error::{FlipflopError, Result};

/// Number of transition classes the network emits for an alphabet of
/// `nbase` bases.
///
/// Each of the `nbase` flip states can be reached from any of the `2 * nbase`
/// states; each flop state only from its own flip state or by staying put.
#[must_use]
pub fn nstate_flipflop(nbase: usize) -> usize {
    2 * nbase * (nbase + 1)
}

/// Inverse of [`nstate_flipflop`]. Returns `None` if `nstate` does not
/// correspond to a whole number of bases.
#[must_use]
pub fn nbase_from_nstate(nstate: usize) -> Option<usize> {
    #[allow(clippy::cast_precision_loss)]
    let nbase = (0.25 + 0.5 * nstate as f64).sqrt() - 0.5;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rounded = nbase.round() as usize;
    (nstate_flipflop(rounded) == nstate).then_some(rounded)
}

/// Encode a base sequence as flip-flop labels.
///
/// Each base keeps its own toggle: the first emission of base `b` is the
/// flip code `b`, a repeat is the flop code `b + nbase`, and so on
/// alternating. Toggles start in the flip state on every call, so the
/// transform is a pure function of the input sequence.
///
/// # Errors
///
/// Returns a data error if any symbol is outside `0..nbase`.
///
/// # Example
///
/// ```rust
/// use flipflop_rs::flipflop::flip_flop_code;
///
/// // "AATC" over ACGT: the repeated A flops to code 4.
/// let code = flip_flop_code(&[0, 0, 3, 1], 4).unwrap();
/// assert_eq!(code, vec![0, 4, 3, 1]);
/// ```
pub fn flip_flop_code(sequence: &[u8], nbase: usize) -> Result<Vec<u32>> {
    let mut flopped = vec![false; nbase];
    let mut code = Vec::with_capacity(sequence.len());
    for &base in sequence {
        let base = base as usize;
        if base >= nbase {
            return Err(FlipflopError::Data(format!(
                "base symbol {base} outside alphabet of size {nbase}"
            )));
        }
        let label = if flopped[base] { base + nbase } else { base };
        flopped[base] = !flopped[base];
        #[allow(clippy::cast_possible_truncation)]
        code.push(label as u32);
    }
    Ok(code)
}

/// Decode flip-flop labels back to the base sequence.
///
/// # Errors
///
/// Returns a data error if any label is outside `0..2 * nbase`.
pub fn flip_flop_decode(code: &[u32], nbase: usize) -> Result<Vec<u8>> {
    code.iter()
        .map(|&label| {
            let label = label as usize;
            if label >= 2 * nbase {
                return Err(FlipflopError::Data(format!(
                    "flip-flop label {label} outside state space of size {}",
                    2 * nbase
                )));
            }
            let base = if label >= nbase { label - nbase } else { label };
            #[allow(clippy::cast_possible_truncation)]
            Ok(base as u8)
        })
        .collect()
}
