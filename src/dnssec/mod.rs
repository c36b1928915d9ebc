pub mod algorithm;
pub mod crypto;
pub mod denial;
pub mod digest;
pub mod key_tag;
pub mod rrsig;
pub mod sealed;
pub mod wire;

pub use algorithm::DnsSecAlgorithm;
pub use crypto::{CryptoProvider, GeneratedKey, SystemCryptoProvider};
pub use denial::{DenialChain, Nsec3Params};
pub use digest::{DigestType, DsRecord};
pub use key_tag::{calculate_key_tag, zone_key_tag};
pub use rrsig::{RrSet, Rrsig, RrsigTemplate};
pub use sealed::KeySealer;

/// DNSKEY protocol field, always 3 (RFC 4034 Section 2.1.2)
pub const DNSKEY_PROTOCOL: u8 = 3;

/// DNSKEY flags for a Zone Signing Key
pub const FLAGS_ZSK: u16 = 0x0100;

/// DNSKEY flags for a Key Signing Key (zone key + SEP)
pub const FLAGS_KSK: u16 = 0x0101;

/// Record type numbers used by the signer
pub mod rtype {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const DS: u16 = 43;
    pub const RRSIG: u16 = 46;
    pub const NSEC: u16 = 47;
    pub const DNSKEY: u16 = 48;
    pub const NSEC3: u16 = 50;
    pub const NSEC3PARAM: u16 = 51;
}

/// Class IN
pub const CLASS_IN: u16 = 1;

/// Build DNSKEY RDATA: flags (2) + protocol (1) + algorithm (1) + public key
pub fn dnskey_rdata(flags: u16, algorithm: u8, public_key: &[u8]) -> Vec<u8> {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(DNSKEY_PROTOCOL);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);
    rdata
}
