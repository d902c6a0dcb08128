//! Dual-parity reconstruction scenario (S5) and the parity invariant (8.6).

use cortex_engine::gf256;
use cortex_engine::router::{self, ParityErasure, Reconstructed};

/// Computes P = XOR over data columns, Q = XOR over (D_i * g^i), matching
/// invariant 6.
fn compute_parity(data: &[u8]) -> (u8, u8) {
    let mut p = 0u8;
    let mut q = 0u8;
    for (i, &d) in data.iter().enumerate() {
        p = gf256::add(p, d);
        q = gf256::add(q, gf256::mul(d, gf256::q_coeff(i)));
    }
    (p, q)
}

/// Invariant 6: for every committed stripe, P = XOR over data cols; Q =
/// XOR over (D_i . g^i) in GF(2^8), and a full row with no erasures
/// reconstructs nothing extra (reconstruct_two must be consistent with the
/// direct computation when asked to recover the real erased pair).
#[test]
fn invariant6_two_erasure_reconstruction_recovers_exact_bytes() {
    let data = [0x11u8, 0x22, 0x33, 0x44, 0x55];
    let (p, q) = compute_parity(&data);

    // Erase columns 1 and 3; "surviving_xor"/"surviving_q" are the parity
    // contributions of everything that did NOT go missing.
    let (x, y) = (1usize, 3usize);
    let surviving_xor = data
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != x && *i != y)
        .fold(0u8, |acc, (_, &d)| gf256::add(acc, d));
    let surviving_q = data
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != x && *i != y)
        .fold(0u8, |acc, (i, &d)| gf256::add(acc, gf256::mul(d, gf256::q_coeff(i))));

    let recovered =
        router::reconstruct_columns(&[x, y], ParityErasure::None, surviving_xor, surviving_q, p, q)
            .unwrap();
    assert_eq!(recovered, Reconstructed::Two(data[x], data[y]));
}

/// S5: a 6-drive parity group (4 data columns + P + Q) with drives
/// {D3, P} offline. A read targeting the block on D3 must succeed via the
/// Q-syndrome path alone, since P itself is unavailable to help.
#[test]
fn s5_single_data_column_recovers_via_q_alone_when_p_is_also_offline() {
    let data = [0xABu8, 0xCDu8, 0x12u8, 0x9Fu8]; // D0..D3
    let (_, q) = compute_parity(&data);

    let missing = 3usize; // D3 offline
    let surviving_q = data
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != missing)
        .fold(0u8, |acc, (i, &d)| gf256::add(acc, gf256::mul(d, gf256::q_coeff(i))));

    let recovered =
        router::reconstruct_columns(&[missing], ParityErasure::P, 0, surviving_q, 0, q).unwrap();
    assert_eq!(recovered, Reconstructed::One(data[missing]));
}

#[test]
fn reconstruct_columns_rejects_duplicate_erasure_indices() {
    let result = router::reconstruct_columns(&[2, 2], ParityErasure::None, 0, 0, 0, 0);
    assert!(result.is_err());
}

#[test]
fn reconstruct_columns_rejects_more_than_two_erasures() {
    let result = router::reconstruct_columns(&[0, 1, 2], ParityErasure::None, 0, 0, 0, 0);
    assert!(result.is_err());
}
