use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits. All core energy,
/// armor ratios and connection weights use this type so the pump is
/// deterministic across platforms.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in sim loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display and persistence.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Checked division for Fixed64 that returns None on zero divisor.
#[inline]
pub fn checked_div_64(a: Fixed64, b: Fixed64) -> Option<Fixed64> {
    a.checked_div(b)
}

/// `value / max` clamped to `[0, 1]`. A zero `max` yields zero.
pub fn ratio(value: Fixed64, max: Fixed64) -> Fixed64 {
    match checked_div_64(value, max) {
        Some(r) => r.clamp(Fixed64::ZERO, Fixed64::ONE),
        None => Fixed64::ZERO,
    }
}
