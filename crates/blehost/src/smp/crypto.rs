//! Security Manager cryptographic toolbox. [Vol 3, Part H, 2.2]
//!
//! All 128-bit and larger values here use specification byte order (most
//! significant byte first). SMP PDUs carry them little-endian on the wire,
//! so callers reverse on ingress and egress. Device addresses are the
//! 6-byte specification-order form produced by [`BdAddr::swapped`].
//!
//! [`BdAddr::swapped`]: crate::gap::BdAddr::swapped

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;

/// Salt for the f5 key derivation function.
const F5_SALT: [u8; 16] = [
    0x6C, 0x88, 0x83, 0x91, 0xAA, 0xF5, 0xA5, 0x38, 0x60, 0x37, 0x0B, 0xDB, 0x5A, 0x60, 0x83, 0xBE,
];

/// "btle" key id used by f5.
const F5_KEY_ID: [u8; 4] = [0x62, 0x74, 0x6C, 0x65];

/// AES-CMAC. [Vol 3, Part H, 2.2.5]
pub fn aes_cmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.into());
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// One AES-128 block encryption, the `e` function of the legacy toolbox.
fn aes_e(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut data = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut data);
    data.into()
}

fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// A fresh 128-bit random value.
pub fn random_128() -> [u8; 16] {
    let mut value = [0u8; 16];
    OsRng.fill_bytes(&mut value);
    value
}

/// A random 6-digit passkey.
pub fn random_passkey() -> u32 {
    OsRng.next_u32() % 1_000_000
}

/// Legacy confirm value generation. [Vol 3, Part H, 2.2.3]
///
/// `preq`/`pres` are the raw 7-byte PDUs in wire order; `ia`/`ra` are the
/// initiating and responding addresses in specification order.
#[allow(clippy::too_many_arguments)]
pub fn c1(
    k: &[u8; 16],
    r: &[u8; 16],
    preq: &[u8; 7],
    pres: &[u8; 7],
    iat: u8,
    rat: u8,
    ia: &[u8; 6],
    ra: &[u8; 6],
) -> [u8; 16] {
    // p1 = pres || preq || rat || iat, with the PDUs reversed out of wire
    // order into spec order.
    let mut p1 = [0u8; 16];
    for i in 0..7 {
        p1[i] = pres[6 - i];
        p1[7 + i] = preq[6 - i];
    }
    p1[14] = rat;
    p1[15] = iat;

    // p2 = padding || ia || ra.
    let mut p2 = [0u8; 16];
    p2[4..10].copy_from_slice(ia);
    p2[10..16].copy_from_slice(ra);

    let round1 = aes_e(k, &xor16(r, &p1));
    aes_e(k, &xor16(&round1, &p2))
}

/// Legacy short term key generation. [Vol 3, Part H, 2.2.4]
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    // r' = least significant halves of r1 and r2.
    let mut r = [0u8; 16];
    r[..8].copy_from_slice(&r1[8..]);
    r[8..].copy_from_slice(&r2[8..]);
    aes_e(k, &r)
}

/// LESC confirm value function. [Vol 3, Part H, 2.2.7]
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
    let mut m = Vec::with_capacity(65);
    m.extend_from_slice(u);
    m.extend_from_slice(v);
    m.push(z);
    aes_cmac(x, &m)
}

/// LESC key generation function. Returns `(MacKey, LTK)`.
/// [Vol 3, Part H, 2.2.8]
pub fn f5(
    w: &[u8; 32],
    n1: &[u8; 16],
    n2: &[u8; 16],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> ([u8; 16], [u8; 16]) {
    let t = aes_cmac(&F5_SALT, w);

    let derive = |counter: u8| -> [u8; 16] {
        let mut m = Vec::with_capacity(53);
        m.push(counter);
        m.extend_from_slice(&F5_KEY_ID);
        m.extend_from_slice(n1);
        m.extend_from_slice(n2);
        m.extend_from_slice(a1);
        m.extend_from_slice(a2);
        m.extend_from_slice(&[0x01, 0x00]); // length = 256 bits
        aes_cmac(&t, &m)
    };

    (derive(0), derive(1))
}

/// LESC check value function. [Vol 3, Part H, 2.2.9]
#[allow(clippy::too_many_arguments)]
pub fn f6(
    w: &[u8; 16],
    n1: &[u8; 16],
    n2: &[u8; 16],
    r: &[u8; 16],
    io_cap: &[u8; 3],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> [u8; 16] {
    let mut m = Vec::with_capacity(65);
    m.extend_from_slice(n1);
    m.extend_from_slice(n2);
    m.extend_from_slice(r);
    m.extend_from_slice(io_cap);
    m.extend_from_slice(a1);
    m.extend_from_slice(a2);
    aes_cmac(w, &m)
}

/// LESC numeric comparison value. [Vol 3, Part H, 2.2.10]
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
    let mut m = Vec::with_capacity(80);
    m.extend_from_slice(u);
    m.extend_from_slice(v);
    m.extend_from_slice(y);
    let out = aes_cmac(x, &m);
    let value = u32::from_be_bytes([out[12], out[13], out[14], out[15]]);
    value % 1_000_000
}

/// The 7-byte address form f5/f6 consume: address type followed by the
/// specification-order address.
pub fn addr7(addr_type: u8, addr: &[u8; 6]) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0] = addr_type;
    out[1..].copy_from_slice(addr);
    out
}

/// The 3-byte IOcap field f6 consumes: AuthReq, OOB flag, IO capability.
pub fn io_cap3(auth_req: u8, oob: u8, io: u8) -> [u8; 3] {
    [auth_req, oob, io]
}

/// A local P-256 key pair for the LESC public key exchange.
pub struct KeyPair {
    secret: EphemeralSecret,
    /// X coordinate, specification order.
    pub public_x: [u8; 32],
    /// Y coordinate, specification order.
    pub public_y: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut public_x = [0u8; 32];
        let mut public_y = [0u8; 32];
        public_x.copy_from_slice(point.x().expect("uncompressed point has x"));
        public_y.copy_from_slice(point.y().expect("uncompressed point has y"));
        Self {
            secret,
            public_x,
            public_y,
        }
    }

    /// Computes the ECDH shared secret against a peer public key given in
    /// specification order. Returns `None` when the coordinates do not name
    /// a valid curve point.
    pub fn dh_key(&self, peer_x: &[u8; 32], peer_y: &[u8; 32]) -> Option<[u8; 32]> {
        let point = EncodedPoint::from_affine_coordinates(peer_x.into(), peer_y.into(), false);
        let peer: Option<PublicKey> = PublicKey::from_encoded_point(&point).into();
        let peer = peer?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Some(out)
    }
}

/// ATT signed-write signature: CMAC over the PDU and sign counter, with the
/// least significant 8 bytes of the MAC appended to the counter.
pub fn sign_att_write(csrk: &[u8; 16], pdu: &[u8], sign_counter: u32) -> [u8; 12] {
    let mut m = Vec::with_capacity(pdu.len() + 4);
    m.extend_from_slice(pdu);
    m.extend_from_slice(&sign_counter.to_le_bytes());
    let mac = aes_cmac(csrk, &m);
    let mut out = [0u8; 12];
    out[..4].copy_from_slice(&sign_counter.to_le_bytes());
    out[4..].copy_from_slice(&mac[8..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h16(s: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).unwrap();
        out
    }

    fn h32(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).unwrap();
        out
    }

    // Sample data from [Vol 3, Part H, Appendix D].

    #[test]
    fn aes_cmac_rfc4493_vectors() {
        let key = h16("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(
            aes_cmac(&key, &[]),
            h16("bb1d6929e95937287fa37d129b756746")
        );
        let msg = h16("6bc1bee22e409f96e93d7e117393172a");
        assert_eq!(
            aes_cmac(&key, &msg),
            h16("070a16b46b4d4144f79bdd9dd04a287c")
        );
    }

    #[test]
    fn f4_sample() {
        let u = h32("20b003d2f297be2c5e2c83a7e9f9a5b9eff49111acf4fddbcc0301480e359de6");
        let v = h32("55188b3d32f6bb9a900afcfbeed4e72a59cb9ac2f19d7cfb6b4fdd49f47fc5fd");
        let x = h16("d5cb8454d177733effffb2ec712baeab");
        assert_eq!(f4(&u, &v, &x, 0x00), h16("f2c916f107a9bd1cf1eda1bea974872d"));
    }

    #[test]
    fn f5_sample() {
        let w = h32("ec0234a357c8ad05341010a60a397d9b99796b13b4f866f1868d34f373bfa698");
        let n1 = h16("d5cb8454d177733effffb2ec712baeab");
        let n2 = h16("a6e8e7cc25a75f6e216583f7ff3dc4cf");
        let a1 = [0x00, 0x56, 0x12, 0x37, 0x37, 0xbf, 0xce];
        let a2 = [0x00, 0xa7, 0x13, 0x70, 0x2d, 0xcf, 0xc1];
        let (mac_key, ltk) = f5(&w, &n1, &n2, &a1, &a2);
        assert_eq!(mac_key, h16("2965f176a1084a02fd3f6a20ce636e20"));
        assert_eq!(ltk, h16("6986791169d7cd23980522b594750a38"));
    }

    #[test]
    fn f6_sample() {
        let w = h16("2965f176a1084a02fd3f6a20ce636e20");
        let n1 = h16("d5cb8454d177733effffb2ec712baeab");
        let n2 = h16("a6e8e7cc25a75f6e216583f7ff3dc4cf");
        let r = h16("12a3343bb453bb5408da42d20c2d0fc8");
        let io_cap = [0x01, 0x01, 0x02];
        let a1 = [0x00, 0x56, 0x12, 0x37, 0x37, 0xbf, 0xce];
        let a2 = [0x00, 0xa7, 0x13, 0x70, 0x2d, 0xcf, 0xc1];
        assert_eq!(
            f6(&w, &n1, &n2, &r, &io_cap, &a1, &a2),
            h16("e3c473989cd0e8c5d26c0b09da958f61")
        );
    }

    #[test]
    fn c1_sample() {
        let k = [0u8; 16];
        let r = h16("5783d52156ad6f0e6388274ec6702ee0");
        // Wire-order PDUs whose spec-order forms are 0x07071000000101 and
        // 0x05000800000302.
        let preq = [0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07];
        let pres = [0x02, 0x03, 0x00, 0x00, 0x08, 0x00, 0x05];
        let ia = [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6];
        let ra = [0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6];
        assert_eq!(
            c1(&k, &r, &preq, &pres, 0x01, 0x00, &ia, &ra),
            h16("1e1e3fef878988ead2a74dc5bef13b86")
        );
    }

    #[test]
    fn s1_sample() {
        let k = [0u8; 16];
        let r1 = h16("000f0e0d0c0b0a091122334455667788");
        let r2 = h16("010203040506070899aabbccddeeff00");
        assert_eq!(
            s1(&k, &r1, &r2),
            h16("9a1fe1f0e8b0f49b5b4216ae796da062")
        );
    }

    #[test]
    fn ecdh_shared_secret_agrees() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = a.dh_key(&b.public_x, &b.public_y).unwrap();
        let ba = b.dh_key(&a.public_x, &a.public_y).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn invalid_public_key_is_rejected() {
        let a = KeyPair::generate();
        assert!(a.dh_key(&[0xFF; 32], &[0xFF; 32]).is_none());
    }

    #[test]
    fn g2_is_six_digits() {
        let u = h32("20b003d2f297be2c5e2c83a7e9f9a5b9eff49111acf4fddbcc0301480e359de6");
        let v = h32("55188b3d32f6bb9a900afcfbeed4e72a59cb9ac2f19d7cfb6b4fdd49f47fc5fd");
        let x = h16("d5cb8454d177733effffb2ec712baeab");
        let y = h16("a6e8e7cc25a75f6e216583f7ff3dc4cf");
        assert!(g2(&u, &v, &x, &y) < 1_000_000);
    }
}
