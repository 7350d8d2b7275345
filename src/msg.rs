//! DNS message helpers
//!
//! Small pieces of wire-format glue shared by the transports, the cache,
//! and the resolver: cache keys, TTL arithmetic, answer-to-IP extraction,
//! and synthesis of empty answers.

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::Rng;

use crate::error::{Error, Result};

/// Cache and single-flight key of a question: `name|type|class`, with the
/// name lowercased so `Example.COM` and `example.com` coalesce.
pub fn question_key(q: &Query) -> String {
    format!(
        "{}|{}|{}",
        q.name().to_string().to_lowercase(),
        q.query_type(),
        q.query_class()
    )
}

/// Whether the question asks for an address record.
pub fn is_ip_request(q: &Query) -> bool {
    matches!(q.query_type(), RecordType::A | RecordType::AAAA)
}

/// Build a recursive query for `host` with a random ID.
pub fn make_query(host: &str, qtype: RecordType) -> Result<Message> {
    let mut name = Name::from_utf8(host)
        .map_err(|e| Error::Dns(format!("invalid query name '{}': {}", host, e)))?;
    name.set_fqdn(true);

    let mut msg = Message::new();
    msg.set_id(rand::rng().random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, qtype));
    Ok(msg)
}

/// Extract every A/AAAA address from the answer section.
pub fn msg_to_ip(msg: &Message) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for answer in msg.answers() {
        match answer.data() {
            RData::A(a) => ips.push(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => ips.push(IpAddr::V6(aaaa.0)),
            _ => {}
        }
    }
    ips
}

/// Build an empty NOERROR reply to `req`, as the Fake-IP client does for
/// question types it does not synthesize.
pub fn empty_answer(req: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_response_code(ResponseCode::NoError);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_authoritative(true);
    msg.set_recursion_available(true);
    for q in req.queries() {
        msg.add_query(q.clone());
    }
    msg
}

/// Set every TTL in the message to a fixed value.
pub fn set_msg_ttl(msg: &mut Message, ttl: u32) {
    map_records(msg, |r| {
        r.set_ttl(ttl);
    });
}

/// Shift the message's TTLs so the smallest one equals `remaining`,
/// flooring each at 1 second.
pub fn update_msg_ttl(msg: &mut Message, remaining: u32) {
    let Some(min) = min_ttl(msg) else {
        return;
    };
    let delta = min.saturating_sub(remaining);
    map_records(msg, |r| {
        let ttl = r.ttl().saturating_sub(delta).max(1);
        r.set_ttl(ttl);
    });
}

/// Minimum TTL across answer, authority, and additional sections.
/// OPT pseudo-records carry no real TTL and are skipped.
pub fn min_ttl(msg: &Message) -> Option<u32> {
    msg.answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
        .filter(|r| r.record_type() != RecordType::OPT)
        .map(Record::ttl)
        .min()
}

/// Remove OPT records. OPT RRs MUST NOT be cached, forwarded, or stored
/// (RFC 6891 section 6.2.1).
pub fn strip_opt(msg: &mut Message) {
    *msg.extensions_mut() = None;
    let additionals: Vec<Record> = msg
        .take_additionals()
        .into_iter()
        .filter(|r| r.record_type() != RecordType::OPT)
        .collect();
    msg.insert_additionals(additionals);
}

/// Copy a cached message for a new request, rewriting its ID.
pub fn copy_with_id(cached: &Message, req: &Message) -> Message {
    let mut msg = cached.clone();
    msg.set_id(req.id());
    msg
}

fn map_records(msg: &mut Message, mut f: impl FnMut(&mut Record)) {
    let mut apply = |records: Vec<Record>| -> Vec<Record> {
        let mut records = records;
        for r in &mut records {
            if r.record_type() != RecordType::OPT {
                f(r);
            }
        }
        records
    };

    let answers = apply(msg.take_answers());
    msg.insert_answers(answers);
    let authority = apply(msg.take_name_servers());
    msg.insert_name_servers(authority);
    let additionals = apply(msg.take_additionals());
    msg.insert_additionals(additionals);
}
