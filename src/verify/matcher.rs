use crate::primitives::split_auxdata;

/// Strength of the equality between on-chain and recompiled runtime
/// bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Byte-for-byte equality.
    Perfect,
    /// Equality after stripping the trailing CBOR auxdata on both sides.
    Partial,
    NoMatch,
}

/// The executable body of a runtime bytecode, without the trailing CBOR
/// auxdata. `None` when the tail's declared length does not fit, in which
/// case no relaxed comparison may use this code.
pub fn strip_auxdata(code: &[u8]) -> Option<&[u8]> {
    split_auxdata(code).map(|(body, _)| body)
}

/// Returns the strongest equality relation that holds between the two
/// bytecodes. Compiler metadata hashes differ across identical-behavior
/// compiler patches and across library link substitutions, which is what the
/// partial relation absorbs.
pub fn match_runtime_code(onchain: &[u8], recompiled: &[u8]) -> Verdict {
    if onchain.is_empty() || recompiled.is_empty() {
        return Verdict::NoMatch;
    }
    if onchain == recompiled {
        return Verdict::Perfect;
    }
    match (strip_auxdata(onchain), strip_auxdata(recompiled)) {
        (Some(a), Some(b)) if a == b => Verdict::Partial,
        _ => Verdict::NoMatch,
    }
}
