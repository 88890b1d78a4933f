use rand::RngCore;

use crate::error::{DavitError, Result};

/// A polynomial over GF(2), bit `i` holding the coefficient of `x^i`.
/// Repository polynomials have degree 53, so all products reduced modulo one
/// fit in 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pol(pub u64);

/// Degree of the chunking polynomial drawn at repository creation.
pub const RANDOM_POL_DEGREE: i32 = 53;

const RANDOM_POL_TRIES: usize = 1_000_000;

impl Pol {
    /// Degree of the polynomial; deg(0) is -1.
    pub fn deg(self) -> i32 {
        63 - self.0.leading_zeros() as i32
    }

    /// Addition over GF(2) is XOR.
    pub fn add(self, other: Pol) -> Pol {
        Pol(self.0 ^ other.0)
    }

    /// Remainder of polynomial division by `d`.
    pub fn rem(self, d: Pol) -> Pol {
        debug_assert!(d.0 != 0, "division by zero polynomial");
        let mut x = self.0;
        let dd = d.deg();
        while Pol(x).deg() >= dd {
            x ^= d.0 << (Pol(x).deg() - dd);
        }
        Pol(x)
    }

    /// `self * f mod g`, keeping intermediates reduced so nothing overflows.
    pub fn mulmod(self, f: Pol, g: Pol) -> Pol {
        let mut res = 0u64;
        let mut a = self.rem(g).0;
        let mut f = f.0;
        while f != 0 {
            if f & 1 != 0 {
                res ^= a;
            }
            f >>= 1;
            a <<= 1;
            a = Pol(a).rem(g).0;
        }
        Pol(res).rem(g)
    }

    pub fn gcd(self, other: Pol) -> Pol {
        let (mut a, mut b) = (self, other);
        while b.0 != 0 {
            let r = a.rem(b);
            a = b;
            b = r;
        }
        a
    }

    /// Ben-Or irreducibility test: `self` is irreducible iff
    /// `gcd(self, x^(2^i) + x mod self) == 1` for all `i` up to deg/2.
    pub fn irreducible(self) -> bool {
        for i in 1..=(self.deg() / 2) {
            if self.gcd(qp(i as u32, self)).0 != 1 {
                return false;
            }
        }
        true
    }

    /// Draw a random irreducible polynomial of degree 53 from OS entropy.
    pub fn random() -> Result<Pol> {
        let mut rng = rand::rngs::OsRng;
        for _ in 0..RANDOM_POL_TRIES {
            let mut f = rng.next_u64();
            // Mask to 54 bits and pin the top bit so the degree is exactly 53.
            f &= (1u64 << (RANDOM_POL_DEGREE as u32 + 1)) - 1;
            f |= 1u64 << RANDOM_POL_DEGREE as u32;
            let pol = Pol(f);
            if pol.irreducible() {
                return Ok(pol);
            }
        }
        Err(DavitError::Other(
            "unable to find an irreducible polynomial".into(),
        ))
    }

    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Pol> {
        let v = u64::from_str_radix(s, 16)
            .map_err(|e| DavitError::Config(format!("invalid chunker polynomial '{s}': {e}")))?;
        if v == 0 {
            return Err(DavitError::Config(
                "chunker polynomial must not be zero".into(),
            ));
        }
        Ok(Pol(v))
    }
}

/// Compute `x^(2^p) + x mod g` by repeated squaring.
fn qp(p: u32, g: Pol) -> Pol {
    let mut res = Pol(2); // the polynomial x
    for _ in 0..p {
        res = res.mulmod(res, g);
    }
    res.add(Pol(2)).rem(g)
}
