//! # Canonical Signable Encoding
//!
//! Deterministic byte representation of messages and sections, fed to the
//! signature primitives. The encoding must be byte-identical across
//! implementations: two sections that should carry different signatures
//! always encode differently, and the same section always encodes to the
//! same bytes.
//!
//! The format is a space-delimited tagged text form: each section opens
//! with a type tag (`:A:`, `:S:`, `:P:`, `:Z:`, `:Q:`, `:AQ:`, `:AA:`,
//! `:AZ:`, `:N:`), followed by its scope fields and bracketed content.
//! Open shard endpoints encode as `<` (negative infinity) and `>`
//! (positive infinity); key and filter bytes are hex-encoded.
//!
//! Contained content is encoded in sorted order. Inputs are not mutated:
//! the encoder sorts a clone when the caller has not already sorted.
//! Signature metadata is appended by the signature engine, never here.

use crate::message::{
    Assertion, AddressAssertion, AddressZone, BloomFilter, CertificateObject, HashAlgorithm,
    Message, ModeOfOperation, NameObject, Notification, Object, Pshard, Query, Section, Shard,
    Zone, ZoneContent,
};
use crate::signature::PublicKey;

/// Encode a whole message: token, then each section in sorted order.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut sorted = msg.clone();
    sorted.sort();
    let mut out = String::new();
    out.push_str(":M: ");
    out.push_str(&hex::encode(sorted.token.as_bytes()));
    out.push_str(" [ ");
    for section in &sorted.content {
        encode_section_into(section, &mut out);
        out.push(' ');
    }
    out.push(']');
    out.into_bytes()
}

/// Encode one section. The result is the exact byte string the signature
/// engine signs (after appending signature metadata).
pub fn encode_section(section: &Section) -> Vec<u8> {
    let mut sorted = section.clone();
    sorted.sort();
    let mut out = String::new();
    encode_section_into(&sorted, &mut out);
    out.into_bytes()
}

fn encode_section_into(section: &Section, out: &mut String) {
    match section {
        Section::Assertion(a) => encode_assertion(a, out),
        Section::Shard(s) => encode_shard(s, out),
        Section::Zone(z) => encode_zone(z, out),
        Section::AddressAssertion(a) => encode_address_assertion(a, out),
        Section::AddressZone(z) => encode_address_zone(z, out),
        Section::Query(q) => encode_query(q, out),
        Section::AddressQuery(q) => {
            out.push_str(":AQ: ");
            out.push_str(&q.context);
            out.push(' ');
            push_subnet(&q.subject_addr, out);
            push_query_tail(q.expiration, &q.types, &q.options, out);
        }
        Section::Notification(n) => encode_notification(n, out),
    }
}

fn encode_assertion(a: &Assertion, out: &mut String) {
    out.push_str(":A: ");
    out.push_str(&a.subject_name);
    out.push(' ');
    out.push_str(&a.subject_zone);
    out.push(' ');
    out.push_str(&a.context);
    out.push_str(" [ ");
    for obj in &a.content {
        encode_object(obj, out);
        out.push(' ');
    }
    out.push(']');
}

fn encode_shard(s: &Shard, out: &mut String) {
    out.push_str(":S: ");
    out.push_str(&s.subject_zone);
    out.push(' ');
    out.push_str(&s.context);
    out.push(' ');
    push_range_endpoint(&s.range_from, false, out);
    out.push(' ');
    push_range_endpoint(&s.range_to, true, out);
    out.push_str(" [ ");
    for a in &s.content {
        encode_assertion(a, out);
        out.push(' ');
    }
    out.push(']');
}

fn encode_pshard(p: &Pshard, out: &mut String) {
    out.push_str(":P: ");
    out.push_str(&p.subject_zone);
    out.push(' ');
    out.push_str(&p.context);
    out.push(' ');
    push_range_endpoint(&p.range_from, false, out);
    out.push(' ');
    push_range_endpoint(&p.range_to, true, out);
    out.push(' ');
    encode_bloom_filter(&p.filter, out);
}

fn encode_zone(z: &Zone, out: &mut String) {
    out.push_str(":Z: ");
    out.push_str(&z.subject_zone);
    out.push(' ');
    out.push_str(&z.context);
    out.push_str(" [ ");
    for content in &z.content {
        match content {
            ZoneContent::Assertion(a) => encode_assertion(a, out),
            ZoneContent::Shard(s) => encode_shard(s, out),
            ZoneContent::Pshard(p) => encode_pshard(p, out),
        }
        out.push(' ');
    }
    out.push(']');
}

fn encode_address_assertion(a: &AddressAssertion, out: &mut String) {
    out.push_str(":AA: ");
    out.push_str(&a.context);
    out.push(' ');
    push_subnet(&a.subject_addr, out);
    out.push_str(" [ ");
    for obj in &a.content {
        encode_object(obj, out);
        out.push(' ');
    }
    out.push(']');
}

fn encode_address_zone(z: &AddressZone, out: &mut String) {
    out.push_str(":AZ: ");
    out.push_str(&z.context);
    out.push(' ');
    push_subnet(&z.subject_addr, out);
    out.push_str(" [ ");
    for a in &z.content {
        encode_address_assertion(a, out);
        out.push(' ');
    }
    out.push(']');
}

fn encode_query(q: &Query, out: &mut String) {
    out.push_str(":Q: ");
    out.push_str(&q.context);
    out.push(' ');
    out.push_str(&q.name);
    push_query_tail(q.expiration, &q.types, &q.options, out);
}

fn push_query_tail(
    expiration: i64,
    types: &[crate::message::ObjectKind],
    options: &[crate::message::QueryOption],
    out: &mut String,
) {
    out.push(' ');
    out.push_str(&expiration.to_string());
    out.push_str(" [");
    for t in types {
        out.push(' ');
        out.push_str(&t.wire().to_string());
    }
    out.push_str(" ] [");
    for o in options {
        out.push(' ');
        out.push_str(&(*o as u8).to_string());
    }
    out.push_str(" ]");
}

fn encode_notification(n: &Notification, out: &mut String) {
    out.push_str(":N: ");
    out.push_str(&hex::encode(n.token.as_bytes()));
    out.push(' ');
    out.push_str(&n.kind.wire().to_string());
    out.push(' ');
    out.push_str(&n.data);
}

fn encode_object(obj: &Object, out: &mut String) {
    match obj {
        Object::Name(NameObject { name, kinds }) => {
            out.push_str(":name: ");
            out.push_str(name);
            out.push_str(" [");
            for k in kinds {
                out.push(' ');
                out.push_str(&k.wire().to_string());
            }
            out.push_str(" ]");
        }
        Object::Ip4(addr) => {
            out.push_str(":ip4: ");
            out.push_str(&addr.to_string());
        }
        Object::Ip6(addr) => {
            out.push_str(":ip6: ");
            out.push_str(&addr.to_string());
        }
        Object::Redirection(name) => {
            out.push_str(":redir: ");
            out.push_str(name);
        }
        Object::Delegation(key) => {
            out.push_str(":deleg: ");
            encode_public_key(key, out);
        }
        Object::NameSet(expr) => {
            out.push_str(":nameset: ");
            out.push_str(expr);
        }
        Object::Certificate(cert) => {
            out.push_str(":cert: ");
            encode_certificate(cert, out);
        }
        Object::ServiceInfo(srv) => {
            out.push_str(":srv: ");
            out.push_str(&srv.name);
            out.push(' ');
            out.push_str(&srv.port.to_string());
            out.push(' ');
            out.push_str(&srv.priority.to_string());
        }
        Object::Registrar(s) => {
            out.push_str(":regr: ");
            out.push_str(s);
        }
        Object::Registrant(s) => {
            out.push_str(":regt: ");
            out.push_str(s);
        }
        Object::InfraKey(key) => {
            out.push_str(":infra: ");
            encode_public_key(key, out);
        }
        Object::ExtraKey { key_space, key } => {
            out.push_str(":extra: ");
            out.push_str(&key_space.wire().to_string());
            out.push(' ');
            encode_public_key(key, out);
        }
        Object::NextKey {
            key,
            valid_since,
            valid_until,
        } => {
            out.push_str(":next: ");
            encode_public_key(key, out);
            out.push(' ');
            out.push_str(&valid_since.to_string());
            out.push(' ');
            out.push_str(&valid_until.to_string());
        }
    }
}

fn encode_public_key(key: &PublicKey, out: &mut String) {
    out.push_str(&key.algorithm().wire().to_string());
    out.push(' ');
    out.push_str(&key.key_phase.to_string());
    out.push(' ');
    out.push_str(&hex::encode(key.key.bytes()));
}

fn encode_certificate(cert: &CertificateObject, out: &mut String) {
    out.push_str(&(cert.protocol as u8).to_string());
    out.push(' ');
    out.push_str(&(cert.usage as u8).to_string());
    out.push(' ');
    out.push_str(&hash_algorithm_tag(cert.hash_algorithm));
    out.push(' ');
    out.push_str(&hex::encode(&cert.data));
}

fn encode_bloom_filter(filter: &BloomFilter, out: &mut String) {
    out.push_str(":bloom: [");
    for h in &filter.hash_family {
        out.push(' ');
        out.push_str(&hash_algorithm_tag(*h));
    }
    out.push_str(" ] ");
    out.push_str(&filter.hash_count.to_string());
    out.push(' ');
    let mode = match filter.mode {
        ModeOfOperation::Standard => "std",
        ModeOfOperation::KirschMitzenmacher1 => "km1",
        ModeOfOperation::KirschMitzenmacher2 => "km2",
    };
    out.push_str(mode);
    out.push(' ');
    out.push_str(&hex::encode(&filter.filter));
}

fn hash_algorithm_tag(h: HashAlgorithm) -> String {
    let tag = match h {
        HashAlgorithm::NoHash => "noHash",
        HashAlgorithm::Sha256 => "sha256",
        HashAlgorithm::Sha384 => "sha384",
        HashAlgorithm::Sha512 => "sha512",
        HashAlgorithm::Fnv64 => "fnv64",
        HashAlgorithm::Murmur364 => "murmur364",
    };
    tag.to_string()
}

fn push_range_endpoint(endpoint: &str, upper: bool, out: &mut String) {
    if endpoint.is_empty() {
        out.push(if upper { '>' } else { '<' });
    } else {
        out.push_str(endpoint);
    }
}

fn push_subnet(subnet: &crate::message::Subnet, out: &mut String) {
    out.push_str(&subnet.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ObjectKind, Token};
    use std::net::Ipv4Addr;

    fn assertion(name: &str) -> Assertion {
        Assertion {
            subject_name: name.to_string(),
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            content: vec![Object::Ip4(Ipv4Addr::new(192, 0, 2, 1))],
            ..Default::default()
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let section = Section::Assertion(assertion("example"));
        assert_eq!(encode_section(&section), encode_section(&section));
    }

    #[test]
    fn distinct_sections_encode_differently() {
        let a = Section::Assertion(assertion("example"));
        let b = Section::Assertion(assertion("exbmple"));
        assert_ne!(encode_section(&a), encode_section(&b));

        let mut other_zone = assertion("example");
        other_zone.subject_zone = "org".to_string();
        assert_ne!(encode_section(&a), encode_section(&Section::Assertion(other_zone)));
    }

    #[test]
    fn encoding_sorts_without_mutating_input() {
        let unsorted = Section::Shard(Shard {
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            range_from: String::new(),
            range_to: String::new(),
            content: vec![assertion("z"), assertion("a")],
            ..Default::default()
        });
        let mut sorted = unsorted.clone();
        sorted.sort();

        assert_eq!(encode_section(&unsorted), encode_section(&sorted));
        // The original order is untouched.
        match &unsorted {
            Section::Shard(s) => assert_eq!(s.content[0].subject_name, "z"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn open_endpoints_encode_as_angle_brackets() {
        let s = Section::Shard(Shard {
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            range_from: String::new(),
            range_to: String::new(),
            content: vec![],
            ..Default::default()
        });
        let encoded = String::from_utf8(encode_section(&s)).unwrap();
        assert!(encoded.contains(" < "), "missing -inf marker: {encoded}");
        assert!(encoded.contains(" > "), "missing +inf marker: {encoded}");
    }

    #[test]
    fn validity_fields_are_not_part_of_the_encoding() {
        let mut a = assertion("example");
        let before = encode_section(&Section::Assertion(a.clone()));
        a.valid_since = 12345;
        a.valid_until = 99999;
        let after = encode_section(&Section::Assertion(a));
        assert_eq!(before, after);
    }

    #[test]
    fn signatures_are_not_part_of_the_encoding() {
        let mut a = assertion("example");
        let before = encode_section(&Section::Assertion(a.clone()));
        a.signatures.push(crate::signature::Signature::new(
            crate::signature::Algorithm::Ed25519,
            1,
            0,
            100,
        ));
        let after = encode_section(&Section::Assertion(a));
        assert_eq!(before, after);
    }

    #[test]
    fn message_encoding_covers_token_and_sections() {
        let token = Token::fresh();
        let msg = Message {
            token,
            content: vec![
                Section::Query(Query {
                    name: "example".to_string(),
                    context: ".".to_string(),
                    expiration: 1000,
                    types: vec![ObjectKind::Ip4],
                    options: vec![],
                }),
                Section::Assertion(assertion("example")),
            ],
            signatures: vec![],
            capabilities: vec![],
        };
        let encoded = String::from_utf8(encode_message(&msg)).unwrap();
        assert!(encoded.starts_with(":M: "));
        assert!(encoded.contains(&hex::encode(token.as_bytes())));
        // Assertion (rank 3) precedes query (rank 6) after sorting.
        let a_pos = encoded.find(":A: ").unwrap();
        let q_pos = encoded.find(":Q: ").unwrap();
        assert!(a_pos < q_pos);
    }
}
