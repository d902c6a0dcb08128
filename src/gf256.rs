//! GF(2^8) arithmetic for dual-parity reconstruction (C6, polynomial
//! 0x11D).
//!
//! Grounded on the standard RAID-6 Galois-field construction (log/antilog
//! tables generated from a primitive element, reconstruction solved via a
//! 2x2 linear system over the field). Tables are built lazily on first use
//! behind a spinlock, matching the `spin`-guarded lazy-init
//! pattern used for its cache structures, and published with a
//! release-fenced atomic ready flag so concurrent readers never observe a
//! half-built table.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

const FIELD_POLY: u16 = 0x11D;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

static READY: AtomicBool = AtomicBool::new(false);
static TABLES: Mutex<Option<Tables>> = Mutex::new(None);

fn build() -> Tables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    for i in 0..255usize {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= FIELD_POLY;
        }
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }
    Tables { exp, log }
}

fn with_tables<R>(f: impl FnOnce(&Tables) -> R) -> R {
    if !READY.load(Ordering::Acquire) {
        let mut guard = TABLES.lock();
        if guard.is_none() {
            *guard = Some(build());
            READY.store(true, Ordering::Release);
        }
    }
    let guard = TABLES.lock();
    f(guard.as_ref().expect("gf256 tables initialized before use"))
}

/// Multiply two field elements.
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    with_tables(|t| {
        let la = t.log[a as usize] as usize;
        let lb = t.log[b as usize] as usize;
        t.exp[la + lb]
    })
}

/// Divide `a` by `b`. Caller must ensure `b != 0`.
pub fn div(a: u8, b: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    with_tables(|t| {
        let la = t.log[a as usize] as usize;
        let lb = t.log[b as usize] as usize;
        t.exp[255 + la - lb]
    })
}

/// Multiplicative inverse. Caller must ensure `a != 0`.
pub fn inv(a: u8) -> u8 {
    div(1, a)
}

/// XOR-based addition/subtraction over GF(2^8).
#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

/// P-parity coefficient for data stripe index `i`: always 1 (plain XOR).
#[inline]
pub fn p_coeff(_i: usize) -> u8 {
    1
}

/// Q-parity coefficient for data stripe index `i`: g^i, where g = 2 is the
/// field's generator.
pub fn q_coeff(i: usize) -> u8 {
    with_tables(|t| t.exp[i % 255])
}

/// Reconstruct two missing data stripes `d[x]` and `d[y]` (`x != y`) given
/// the surviving data stripes, and the computed P and Q parity bytes, for
/// one byte position. Standard RAID-6 two-erasure recovery.
pub fn reconstruct_two(
    x: usize,
    y: usize,
    surviving_xor: u8,
    surviving_q: u8,
    p: u8,
    q: u8,
) -> (u8, u8) {
    // p = surviving_xor ^ dx ^ dy  =>  dx ^ dy = p ^ surviving_xor
    let dx_xor_dy = add(p, surviving_xor);
    // q = surviving_q ^ g^x*dx ^ g^y*dy
    let gx = q_coeff(x);
    let gy = q_coeff(y);
    // g^x*dx ^ g^y*dy = q ^ surviving_q
    let rhs = add(q, surviving_q);
    // dy = (rhs ^ gx*dx_xor_dy) / (gx ^ gy), derived by substituting
    // dx = dx_xor_dy ^ dy into the Q equation.
    let denom = add(gx, gy);
    let dy = div(add(rhs, mul(gx, dx_xor_dy)), denom);
    let dx = add(dx_xor_dy, dy);
    (dx, dy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_identity_and_zero() {
        assert_eq!(mul(5, 1), 5);
        assert_eq!(mul(5, 0), 0);
        assert_eq!(mul(0, 200), 0);
    }

    #[test]
    fn div_inverts_mul() {
        for a in 1u8..=250 {
            let b = 7u8;
            let product = mul(a, b);
            assert_eq!(div(product, b), a);
        }
    }

    #[test]
    fn inverse_round_trips() {
        for a in 1u8..=255 {
            assert_eq!(mul(a, inv(a)), 1);
        }
    }

    #[test]
    fn two_erasure_reconstruction_recovers_original() {
        let data = [3u8, 201, 77, 9, 250];
        let p = data.iter().fold(0u8, |acc, &d| add(acc, d));
        let q = data
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, &d)| add(acc, mul(q_coeff(i), d)));

        // Erase indices 1 and 3.
        let surviving_xor = add(add(data[0], data[2]), data[4]);
        let surviving_q = add(
            add(mul(q_coeff(0), data[0]), mul(q_coeff(2), data[2])),
            mul(q_coeff(4), data[4]),
        );

        let (dx, dy) = reconstruct_two(1, 3, surviving_xor, surviving_q, p, q);
        assert_eq!(dx, data[1]);
        assert_eq!(dy, data[3]);
    }
}
