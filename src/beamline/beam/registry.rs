use std::sync::Mutex;

use crate::beamline::chunk::{Brigade, Chunk};

/// A beamer translates a chunk the beam has no native transfer for into
/// receiver-side chunks appended to out. Returns the number of data bytes
/// produced when it handled the chunk, None to pass to the next beamer.
pub type BeamerFn = fn(out: &mut Brigade, chunk: &Chunk) -> Option<u64>;

// Process-wide, consulted in registration order (lowest order value first.)
static BEAMERS: Mutex<Vec<(i32, BeamerFn)>> = Mutex::new(Vec::new());

/// Globally register a translator for chunk kinds the beam cannot transfer
/// natively. Beamers with a lower order value are consulted first.
pub fn register_beamer(order: i32, f: BeamerFn) {
    let mut beamers = BEAMERS.lock().unwrap_or_else(|e| e.into_inner());
    let i = beamers
        .iter()
        .position(|(o, _)| *o > order)
        .unwrap_or(beamers.len());
    beamers.insert(i, (order, f));
}

/// Remove all globally registered beamers. Exposed for use in tests.
#[cfg(test)]
pub(crate) fn clear_beamers() {
    BEAMERS.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

pub(crate) fn run_beamers(out: &mut Brigade, chunk: &Chunk) -> Option<u64> {
    let beamers = BEAMERS.lock().unwrap_or_else(|e| e.into_inner());
    for (_, f) in beamers.iter() {
        if let Some(n) = f(out, chunk) {
            return Some(n);
        }
    }
    None
}
