//! Interval bound maintenance for scalar registers.
//!
//! A scalar carries five partially redundant views: the known-bits tracking
//! and four intervals (signed/unsigned at 32 and 64 bits). Every refinement
//! must be followed by [`sync_bounds`], which lets each view tighten the
//! others until agreement. ALU transfer functions compute in the operation's
//! natural width and derive the other width conservatively.

use krait_asm::AluOp;

use crate::reg::RegState;
use crate::tnum::Tnum;

/// Re-establish agreement between the five views of `reg`.
///
/// Runs the tighten / deduce / bit-learn / re-tighten sequence at both
/// widths. Idempotent once agreement is reached.
pub fn sync_bounds(reg: &mut RegState) {
    update_bounds32(reg);
    update_bounds64(reg);
    deduce_bounds32(reg);
    deduce_bounds64(reg);
    bound_offset(reg);
    update_bounds32(reg);
    update_bounds64(reg);
}

fn update_bounds64(reg: &mut RegState) {
    let value = reg.var_off.value();
    let mask = reg.var_off.mask();
    // min signed: assume the unknown sign bit set, other unknowns clear
    reg.smin = reg.smin.max((value | (mask & (1 << 63))) as i64);
    // max signed: assume the unknown sign bit clear, other unknowns set
    reg.smax = reg.smax.min((value | (mask & !(1 << 63))) as i64);
    reg.umin = reg.umin.max(value);
    reg.umax = reg.umax.min(value | mask);
}

fn update_bounds32(reg: &mut RegState) {
    let sub = reg.var_off.subreg();
    let value = sub.value() as u32;
    let mask = sub.mask() as u32;
    reg.s32_min = reg.s32_min.max((value | (mask & (1 << 31))) as i32);
    reg.s32_max = reg.s32_max.min((value | (mask & !(1 << 31))) as i32);
    reg.u32_min = reg.u32_min.max(value);
    reg.u32_max = reg.u32_max.min(value | mask);
}

fn deduce_bounds64(reg: &mut RegState) {
    if reg.smin >= 0 || reg.smax < 0 {
        // The signed range does not cross zero, so both orders agree.
        reg.smin = reg.smin.max(reg.umin as i64);
        reg.umin = reg.smin as u64;
        reg.smax = reg.smax.min(reg.umax as i64);
        reg.umax = reg.smax as u64;
        return;
    }
    if (reg.umax as i64) >= 0 {
        // Unsigned range below the sign boundary: value is non-negative.
        reg.smin = reg.umin as i64;
        reg.smax = reg.smax.min(reg.umax as i64);
        reg.umax = reg.smax as u64;
    } else if (reg.umin as i64) < 0 {
        // Unsigned range entirely above the boundary: value is negative.
        reg.smin = reg.smin.max(reg.umin as i64);
        reg.umin = reg.smin as u64;
        reg.smax = reg.umax as i64;
    }
}

fn deduce_bounds32(reg: &mut RegState) {
    if reg.s32_min >= 0 || reg.s32_max < 0 {
        reg.s32_min = reg.s32_min.max(reg.u32_min as i32);
        reg.u32_min = reg.s32_min as u32;
        reg.s32_max = reg.s32_max.min(reg.u32_max as i32);
        reg.u32_max = reg.s32_max as u32;
        return;
    }
    if (reg.u32_max as i32) >= 0 {
        reg.s32_min = reg.u32_min as i32;
        reg.s32_max = reg.s32_max.min(reg.u32_max as i32);
        reg.u32_max = reg.s32_max as u32;
    } else if (reg.u32_min as i32) < 0 {
        reg.s32_min = reg.s32_min.max(reg.u32_min as i32);
        reg.u32_min = reg.s32_min as u32;
        reg.s32_max = reg.u32_max as i32;
    }
}

fn bound_offset(reg: &mut RegState) {
    let span = Tnum::range(reg.umin, reg.umax);
    let span32 = Tnum::range(reg.u32_min as u64, reg.u32_max as u64);
    reg.var_off = reg
        .var_off
        .intersect(span)
        .with_subreg(reg.var_off.subreg().intersect(span32));
}

/// Rebuild the 64-bit views of a register whose upper half is known zero,
/// from its 32-bit views.
pub fn zext_32_to_64(reg: &mut RegState) {
    reg.var_off = reg.var_off.subreg();
    reg.umin = reg.u32_min as u64;
    reg.umax = reg.u32_max as u64;
    if reg.s32_min >= 0 {
        reg.smin = reg.s32_min as i64;
        reg.smax = reg.s32_max as i64;
    } else {
        reg.smin = reg.u32_min as i64;
        reg.smax = reg.u32_max as i64;
    }
    sync_bounds(reg);
}

/// Derive fresh 32-bit views from the 64-bit views after a 64-bit
/// operation.
pub fn combine_64_into_32(reg: &mut RegState) {
    reg.set_unbounded32();
    if reg.umin >> 32 == reg.umax >> 32 {
        // One 4GiB page; the subregister moves with the full value.
        reg.u32_min = reg.umin as u32;
        reg.u32_max = reg.umax as u32;
    }
    if reg.smin >= 0 && reg.smax <= u32::MAX as i64 {
        reg.s32_min = reg.smin.max(0) as i32;
        reg.s32_max = reg.smax as i32;
    }
    sync_bounds(reg);
}

/// Truncate `reg` to its low `size` bytes, zero-extending.
pub fn coerce_to_size(reg: &mut RegState, size: u32) {
    if size >= 8 {
        return;
    }
    let truncated = reg.var_off.cast(size as usize);
    let max = (1u64 << (size * 8)) - 1;
    // When the value provably fits, truncation is the identity and the
    // interval survives; otherwise wrap-around forfeits it.
    let keep = (reg.umax <= max).then_some((reg.umin, reg.umax));
    reg.set_unbounded();
    reg.var_off = truncated;
    match keep {
        Some((umin, umax)) => {
            reg.umin = umin;
            reg.umax = umax;
            reg.smin = umin as i64;
            reg.smax = umax as i64;
        }
        None => {
            reg.umin = 0;
            reg.umax = max;
            reg.smin = 0;
            reg.smax = max as i64;
        }
    }
    sync_bounds(reg);
}

/// Truncate `reg` to its low `size` bytes, sign-extending the result to 64
/// bits.
pub fn coerce_to_size_sx(reg: &mut RegState, size: u32) {
    debug_assert!(size < 8);
    let bits = size * 8;
    let truncated = reg.var_off.cast(size as usize);
    let sign_bit = 1u64 << (bits - 1);

    reg.set_unbounded();
    if truncated.is_const() {
        let v = truncated.value();
        let extended = if v & sign_bit != 0 {
            v | !((1u64 << bits) - 1)
        } else {
            v
        };
        reg.set_constant(extended);
        return;
    }
    if truncated.mask() & sign_bit == 0 {
        // Sign bit is known.
        if truncated.value() & sign_bit == 0 {
            reg.var_off = truncated;
            reg.smin = 0;
            reg.smax = (sign_bit - 1) as i64;
            reg.umin = 0;
            reg.umax = sign_bit - 1;
        } else {
            let high = !((1u64 << bits) - 1);
            reg.var_off = Tnum::new(truncated.value() | high, truncated.mask());
            reg.smin = (sign_bit as i64).wrapping_neg();
            reg.smax = -1;
        }
    } else {
        reg.var_off = Tnum::UNKNOWN;
        reg.smin = -(sign_bit as i64);
        reg.smax = (sign_bit - 1) as i64;
    }
    sync_bounds(reg);
}

/// Apply a 64-bit scalar ALU operation to `dst`'s views.
///
/// Shift counts are assumed pre-checked when constant; variable shifts that
/// may reach the width degrade to unbounded. Division and modulo never trap
/// (zero divisors yield zero / leave the dividend), so they only widen.
pub fn apply_alu64(dst: &mut RegState, src: &RegState, op: AluOp) {
    match op {
        AluOp::Add => {
            dst.smin = saturating_opt(dst.smin.checked_add(src.smin), i64::MIN);
            dst.smax = saturating_opt(dst.smax.checked_add(src.smax), i64::MAX);
            if dst.smin == i64::MIN || dst.smax == i64::MAX {
                dst.smin = i64::MIN;
                dst.smax = i64::MAX;
            }
            match (
                dst.umin.checked_add(src.umin),
                dst.umax.checked_add(src.umax),
            ) {
                (Some(umin), Some(umax)) => {
                    dst.umin = umin;
                    dst.umax = umax;
                }
                _ => {
                    dst.umin = 0;
                    dst.umax = u64::MAX;
                }
            }
            dst.var_off = dst.var_off.add(src.var_off);
        }
        AluOp::Sub => {
            let (smin, smax) = (
                dst.smin.checked_sub(src.smax),
                dst.smax.checked_sub(src.smin),
            );
            match (smin, smax) {
                (Some(lo), Some(hi)) => {
                    dst.smin = lo;
                    dst.smax = hi;
                }
                _ => {
                    dst.smin = i64::MIN;
                    dst.smax = i64::MAX;
                }
            }
            if dst.umin < src.umax {
                dst.umin = 0;
                dst.umax = u64::MAX;
            } else {
                dst.umin -= src.umax;
                dst.umax -= src.umin;
            }
            dst.var_off = dst.var_off.sub(src.var_off);
        }
        AluOp::Mul => {
            dst.var_off = dst.var_off.mul(src.var_off);
            if dst.smin < 0 || src.smin < 0 {
                dst.smin = i64::MIN;
                dst.smax = i64::MAX;
                dst.umin = 0;
                dst.umax = u64::MAX;
            } else {
                match (
                    dst.umin.checked_mul(src.umin),
                    dst.umax.checked_mul(src.umax),
                ) {
                    (Some(umin), Some(umax)) if umax <= i64::MAX as u64 => {
                        dst.umin = umin;
                        dst.umax = umax;
                        dst.smin = umin as i64;
                        dst.smax = umax as i64;
                    }
                    _ => {
                        dst.smin = i64::MIN;
                        dst.smax = i64::MAX;
                        dst.umin = 0;
                        dst.umax = u64::MAX;
                    }
                }
            }
        }
        AluOp::And => {
            dst.var_off = dst.var_off.and(src.var_off);
            let negative = dst.smin < 0 || src.smin < 0;
            dst.umin = dst.var_off.value();
            dst.umax = dst.umax.min(src.umax);
            if negative {
                dst.smin = i64::MIN;
                dst.smax = i64::MAX;
            } else {
                // Conjunction of non-negatives stays non-negative.
                dst.smin = dst.umin as i64;
                dst.smax = dst.umax as i64;
            }
        }
        AluOp::Or => {
            dst.var_off = dst.var_off.or(src.var_off);
            let negative = dst.smin < 0 || src.smin < 0;
            dst.umin = dst.umin.max(src.umin);
            dst.umax = dst.var_off.value() | dst.var_off.mask();
            if negative {
                dst.smin = i64::MIN;
                dst.smax = i64::MAX;
            } else {
                dst.smin = dst.umin as i64;
                dst.smax = dst.umax as i64;
            }
        }
        AluOp::Xor => {
            dst.var_off = dst.var_off.xor(src.var_off);
            dst.umin = dst.var_off.value();
            dst.umax = dst.var_off.value() | dst.var_off.mask();
            if dst.smin >= 0 && src.smin >= 0 {
                dst.smin = dst.umin as i64;
                dst.smax = dst.umax as i64;
            } else {
                dst.smin = i64::MIN;
                dst.smax = i64::MAX;
            }
        }
        AluOp::Lsh => {
            if let Some(shift) = shift_amount(src, 64) {
                dst.var_off = dst.var_off.lshift(shift);
                match (
                    dst.umin.checked_shl(shift as u32),
                    dst.umax.checked_shl(shift as u32),
                ) {
                    (Some(umin), Some(umax))
                        if shift == 0 || dst.umax.leading_zeros() >= shift as u32 =>
                    {
                        dst.umin = umin;
                        dst.umax = umax;
                    }
                    _ => {
                        dst.umin = 0;
                        dst.umax = u64::MAX;
                    }
                }
            } else {
                dst.var_off = Tnum::UNKNOWN;
                dst.umin = 0;
                dst.umax = u64::MAX;
            }
            dst.smin = i64::MIN;
            dst.smax = i64::MAX;
        }
        AluOp::Rsh => {
            if let Some(shift) = shift_amount(src, 64) {
                dst.var_off = dst.var_off.rshift(shift);
                dst.umin >>= shift;
                dst.umax >>= shift;
            } else {
                dst.var_off = Tnum::UNKNOWN;
                dst.umin = 0;
                dst.umax >>= src.umin.min(63);
            }
            // Signed views re-derived from the unsigned ones on sync.
            dst.smin = i64::MIN;
            dst.smax = i64::MAX;
        }
        AluOp::Arsh => {
            if let Some(shift) = shift_amount(src, 64) {
                dst.var_off = dst.var_off.arshift(shift, 64);
                dst.smin >>= shift;
                dst.smax >>= shift;
            } else {
                dst.var_off = Tnum::UNKNOWN;
                let max_shift = src.umax.min(63) as u8;
                let min_shift = src.umin.min(63) as u8;
                dst.smin = (dst.smin >> min_shift).min(dst.smin >> max_shift);
                dst.smax = (dst.smax >> min_shift).max(dst.smax >> max_shift);
            }
            dst.umin = 0;
            dst.umax = u64::MAX;
        }
        AluOp::Div => {
            // Unsigned division; a zero divisor yields zero.
            dst.var_off = Tnum::UNKNOWN;
            dst.umin = 0;
            dst.smin = i64::MIN;
            dst.smax = i64::MAX;
        }
        AluOp::Mod => {
            // A zero divisor leaves the dividend unchanged.
            dst.var_off = Tnum::UNKNOWN;
            dst.umin = 0;
            dst.umax = dst.umax.max(src.umax);
            dst.smin = i64::MIN;
            dst.smax = i64::MAX;
        }
        AluOp::Neg => {
            let zero = RegState::constant(0);
            let mut result = zero;
            result.live = dst.live;
            let operand = dst.clone();
            *dst = result;
            apply_alu64(dst, &operand, AluOp::Sub);
            return;
        }
        AluOp::Mov | AluOp::End => {
            // Handled by the instruction checker, not the value domain.
            dst.set_unbounded();
        }
    }
    dst.set_unbounded32();
    sync_bounds(dst);
    combine_64_into_32(dst);
}

/// Apply a 32-bit scalar ALU operation; the destination's upper half becomes
/// known zero.
pub fn apply_alu32(dst: &mut RegState, src: &RegState, op: AluOp) {
    if op == AluOp::Arsh {
        // The zero-extended proxy below misplaces the sign bit, so the
        // arithmetic shift keeps only its width.
        let truncated = dst.var_off.subreg().arshift(
            src.const_value().map(|v| v.min(31) as u8).unwrap_or(0),
            32,
        );
        dst.set_unbounded();
        dst.var_off = if src.is_const() { truncated } else { Tnum::UNKNOWN };
        coerce_to_size(dst, 4);
        return;
    }

    // Compute in a 64-bit proxy over the zero-extended subregister values,
    // then project back. Wrap-around at 32 bits is modeled by the final
    // truncation.
    let mut proxy = dst.clone();
    proxy.var_off = dst.var_off.subreg();
    proxy.umin = dst.u32_min as u64;
    proxy.umax = dst.u32_max as u64;
    proxy.smin = dst.s32_min as i64;
    proxy.smax = dst.s32_max as i64;

    let mut src32 = src.clone();
    src32.var_off = src.var_off.subreg();
    src32.umin = src.u32_min as u64;
    src32.umax = src.u32_max as u64;
    src32.smin = src.s32_min as i64;
    src32.smax = src.s32_max as i64;

    apply_alu64(&mut proxy, &src32, op);
    coerce_to_size(&mut proxy, 4);

    proxy.live = dst.live;
    proxy.precise = dst.precise;
    *dst = proxy;
}

fn saturating_opt(value: Option<i64>, fallback: i64) -> i64 {
    value.unwrap_or(fallback)
}

/// Shift amount when it is a usable known constant below `width`.
fn shift_amount(src: &RegState, width: u64) -> Option<u8> {
    src.const_value()
        .filter(|&v| v < width)
        .map(|v| v as u8)
}

#[cfg(test)]
mod tests {
    use quickcheck::{
        Arbitrary,
        Gen,
    };
    use quickcheck_macros::quickcheck;
    use test_case::test_case;

    use super::*;

    /// A register with coherent views built from a pair of constants.
    #[derive(Debug, Clone)]
    struct ArbScalar(RegState);

    impl Arbitrary for ArbScalar {
        fn arbitrary(g: &mut Gen) -> Self {
            let a = u64::arbitrary(g);
            let b = u64::arbitrary(g);
            let mut reg = RegState::unknown_scalar();
            reg.umin = a.min(b);
            reg.umax = a.max(b);
            if bool::arbitrary(g) {
                // Sometimes add known-bits knowledge.
                reg.var_off = Tnum::range(reg.umin, reg.umax);
            }
            sync_bounds(&mut reg);
            Self(reg)
        }
    }

    fn coherent(reg: &RegState) -> bool {
        reg.var_off.value() & reg.var_off.mask() == 0
            && reg.umin <= reg.umax
            && reg.smin <= reg.smax
            && reg.u32_min <= reg.u32_max
            && reg.s32_min <= reg.s32_max
            && reg.var_off.contains_value(reg.umin)
            && reg.var_off.contains_value(reg.umax)
    }

    fn contains(reg: &RegState, value: u64) -> bool {
        reg.var_off.contains_value(value)
            && reg.umin <= value
            && value <= reg.umax
            && reg.smin <= value as i64
            && (value as i64) <= reg.smax
            && reg.u32_min <= value as u32
            && (value as u32) <= reg.u32_max
            && reg.s32_min <= value as u32 as i32
            && (value as u32 as i32) <= reg.s32_max
    }

    /// A member of the register's concretization, chosen by `seed`.
    fn member(reg: &RegState, seed: u64) -> u64 {
        let candidate = reg.var_off.value() | (seed & reg.var_off.mask());
        candidate.clamp(reg.umin, reg.umax)
    }

    #[quickcheck]
    fn sync_keeps_coherence(reg: ArbScalar) -> bool {
        let mut reg = reg.0;
        sync_bounds(&mut reg);
        coherent(&reg)
    }

    #[quickcheck]
    fn sync_is_idempotent(reg: ArbScalar) -> bool {
        let mut once = reg.0.clone();
        sync_bounds(&mut once);
        let mut twice = once.clone();
        sync_bounds(&mut twice);
        once.umin == twice.umin
            && once.umax == twice.umax
            && once.smin == twice.smin
            && once.smax == twice.smax
            && once.var_off == twice.var_off
    }

    #[quickcheck]
    fn alu64_is_sound(dst: ArbScalar, src: ArbScalar, x: u64, y: u64) -> bool {
        let ops = [
            AluOp::Add,
            AluOp::Sub,
            AluOp::Mul,
            AluOp::And,
            AluOp::Or,
            AluOp::Xor,
        ];
        let a = member(&dst.0, x);
        let b = member(&src.0, y);
        ops.iter().all(|&op| {
            let mut reg = dst.0.clone();
            apply_alu64(&mut reg, &src.0, op);
            let concrete = match op {
                AluOp::Add => a.wrapping_add(b),
                AluOp::Sub => a.wrapping_sub(b),
                AluOp::Mul => a.wrapping_mul(b),
                AluOp::And => a & b,
                AluOp::Or => a | b,
                AluOp::Xor => a ^ b,
                _ => unreachable!(),
            };
            contains(&reg, concrete)
        })
    }

    #[quickcheck]
    fn const_shifts_are_sound(dst: ArbScalar, x: u64, shift: u8) -> bool {
        let shift = shift % 64;
        let a = member(&dst.0, x);
        let src = RegState::constant(shift as u64);
        [AluOp::Lsh, AluOp::Rsh, AluOp::Arsh].iter().all(|&op| {
            let mut reg = dst.0.clone();
            apply_alu64(&mut reg, &src, op);
            let concrete = match op {
                AluOp::Lsh => a << shift,
                AluOp::Rsh => a >> shift,
                AluOp::Arsh => ((a as i64) >> shift) as u64,
                _ => unreachable!(),
            };
            contains(&reg, concrete)
        })
    }

    #[quickcheck]
    fn alu32_zero_extends(dst: ArbScalar, src: ArbScalar) -> bool {
        let mut reg = dst.0.clone();
        apply_alu32(&mut reg, &src.0, AluOp::Add);
        reg.umax <= u32::MAX as u64 && reg.smin >= 0
    }

    #[test_case(4, 0xffff_ffff_8000_0001, -0x7fff_ffff; "word negative")]
    #[test_case(4, 0x0000_0000_7fff_ffff, 0x7fff_ffff; "word positive")]
    #[test_case(1, 0xff, -1; "byte all ones")]
    #[test_case(2, 0x7fff, 0x7fff; "half positive")]
    fn sign_extension(size: u32, input: u64, expected: i64) {
        let mut reg = RegState::constant(input);
        coerce_to_size_sx(&mut reg, size);
        assert_eq!(reg.const_value(), Some(expected as u64));
    }

    #[test]
    fn add_overflow_degrades() {
        let mut reg = RegState::constant(u64::MAX - 1);
        let src = RegState::constant(5);
        apply_alu64(&mut reg, &src, AluOp::Add);
        // wrapped: the exact result is still a member
        assert!(reg.var_off.contains_value(3));
    }

    #[test]
    fn and_of_nonnegatives_is_nonnegative() {
        let mut reg = RegState::unknown_scalar();
        reg.smin = 0;
        reg.smax = 100;
        reg.umin = 0;
        reg.umax = 100;
        sync_bounds(&mut reg);
        let mut mask = RegState::constant(0x3f);
        mask.live = Default::default();
        apply_alu64(&mut reg, &mask, AluOp::And);
        assert!(reg.smin >= 0);
        assert!(reg.umax <= 0x3f);
    }

    #[test]
    fn neg_of_constant() {
        let mut reg = RegState::constant(5);
        let src = RegState::constant(0);
        apply_alu64(&mut reg, &src, AluOp::Neg);
        assert_eq!(reg.const_value(), Some(5u64.wrapping_neg()));
    }
}
