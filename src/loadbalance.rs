//! Address record load balancing.
//!
//! The [`LoadBalance`] plugin reorders the `A` and `AAAA` records of successful replies written
//! further down the chain. Other records keep their relative order and follow the address
//! records. Three [`Policy`] variants are supported:
//!
//! * `random`: a fresh uniform shuffle for every reply.
//! * `stateless_rotate`: rotate by the query's message ID. The server keeps no state, so the
//!   ordering is whatever the client-chosen ID maps to. Successive queries only walk through
//!   the rotations as far as the client's IDs do; a client that reuses an ID gets the same
//!   order every time.
//! * `stateful_rotate`: rotate by one more position for every query with the same client
//!   subnet, question name and question type.

use crate::error::Error;
use crate::plugin::{Context, Next, Outcome, Plugin, ResponseWriter};
use crate::request::RequestState;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use trust_dns_server::client::op::{Message, ResponseCode};
use trust_dns_server::client::rr::{LowerName, Record, RecordType};

/// IPv4 clients sharing this prefix share a rotation.
pub const V4_SUBNET_PREFIX: u8 = 24;
/// IPv6 clients sharing this prefix share a rotation.
pub const V6_SUBNET_PREFIX: u8 = 56;
/// The rotation table is reset once it tracks this many keys.
pub const MAX_ROTATIONS: usize = 65_536;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    #[default]
    Random,
    StatelessRotate,
    StatefulRotate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RotationKey {
    subnet: IpNetwork,
    name: LowerName,
    query_type: RecordType,
}

impl RotationKey {
    fn new(state: &RequestState) -> Self {
        Self {
            subnet: subnet(state.ip()),
            name: state.name().clone(),
            query_type: state.query_type(),
        }
    }
}

fn subnet(ip: IpAddr) -> IpNetwork {
    let prefix = if ip.is_ipv4() {
        V4_SUBNET_PREFIX
    } else {
        V6_SUBNET_PREFIX
    };
    IpNetwork::new(ip, prefix)
        .and_then(|network| IpNetwork::new(network.network(), prefix))
        .unwrap_or_else(|_| IpNetwork::from(ip))
}

pub struct LoadBalance {
    policy: Policy,
    rotations: DashMap<RotationKey, usize>,
}

impl LoadBalance {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            rotations: DashMap::new(),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Reorder `records` for the reply to `state`: address records first, in policy order,
    /// then everything else in its original order.
    pub fn reorder(&self, state: &RequestState, records: Vec<Record>) -> Vec<Record> {
        let (mut addresses, others): (Vec<Record>, Vec<Record>) = records
            .into_iter()
            .partition(|record| matches!(record.record_type(), RecordType::A | RecordType::AAAA));

        if addresses.len() > 1 {
            match self.policy {
                Policy::Random => fastrand::shuffle(&mut addresses),
                Policy::StatelessRotate => {
                    let offset = usize::from(state.id()) % addresses.len();
                    addresses.rotate_left(offset);
                }
                Policy::StatefulRotate => {
                    let offset = self.next_offset(state, addresses.len());
                    addresses.rotate_left(offset);
                }
            }
        }

        addresses.extend(others);
        addresses
    }

    fn next_offset(&self, state: &RequestState, len: usize) -> usize {
        if self.rotations.len() >= MAX_ROTATIONS {
            self.rotations.clear();
        }
        let mut counter = self.rotations.entry(RotationKey::new(state)).or_insert(0);
        let offset = *counter % len;
        *counter = counter.wrapping_add(1);
        offset
    }
}

#[async_trait::async_trait]
impl Plugin for LoadBalance {
    fn name(&self) -> &'static str {
        "loadbalance"
    }

    async fn serve(
        &self,
        ctx: &Context,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
        next: Next<'_>,
    ) -> Result<Outcome, Error> {
        let mut balanced = LoadBalanceWriter {
            balancer: self,
            state,
            inner: writer,
        };
        next.run(ctx, state, &mut balanced).await
    }
}

struct LoadBalanceWriter<'a> {
    balancer: &'a LoadBalance,
    state: &'a RequestState,
    inner: &'a mut dyn ResponseWriter,
}

impl ResponseWriter for LoadBalanceWriter<'_> {
    fn write_msg(&mut self, mut msg: Message) -> Result<(), Error> {
        if msg.response_code() == ResponseCode::NoError {
            let answers = msg.take_answers();
            msg.insert_answers(self.balancer.reorder(self.state, answers));
        }
        self.inner.write_msg(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::tests::{query_msg, state};
    use crate::request::Transport;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::str::FromStr;
    use std::sync::Arc;
    use trust_dns_server::client::rr::{Name, RData};

    fn answers(count: u8) -> Vec<Record> {
        let owner = Name::from_str("www.example.org.").unwrap();
        let mut records = vec![Record::from_rdata(
            owner.clone(),
            300,
            RData::CNAME(Name::from_str("web.example.org.").unwrap()),
        )];
        records.extend((1..=count).map(|i| {
            Record::from_rdata(owner.clone(), 300, RData::A(Ipv4Addr::new(192, 0, 2, i)))
        }));
        records
    }

    fn addresses(records: &[Record]) -> Vec<Ipv4Addr> {
        records
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(ip)) => Some(*ip),
                _ => None,
            })
            .collect()
    }

    fn state_from(src: &str, id: u16) -> RequestState {
        let mut msg = query_msg("www.example.org.", RecordType::A, None);
        msg.set_id(id);
        let src: SocketAddr = src.parse().unwrap();
        RequestState::new(msg, src, Transport::Udp).unwrap()
    }

    #[test]
    fn test_others_follow_addresses() {
        for policy in [
            Policy::Random,
            Policy::StatelessRotate,
            Policy::StatefulRotate,
        ] {
            let lb = LoadBalance::new(policy);
            let state = state("www.example.org.", RecordType::A, Transport::Udp);
            let reordered = lb.reorder(&state, answers(4));
            assert_eq!(reordered.len(), 5);
            assert!(reordered[..4]
                .iter()
                .all(|record| record.record_type() == RecordType::A));
            assert_eq!(reordered[4].record_type(), RecordType::CNAME);

            let mut sorted = addresses(&reordered);
            sorted.sort();
            assert_eq!(sorted, addresses(&answers(4)));
        }
    }

    #[test]
    fn test_stateful_rotation_cycles() {
        let lb = LoadBalance::new(Policy::StatefulRotate);
        let k = 4;
        let mut seen = HashSet::new();
        for _ in 0..k {
            let state = state_from("192.0.2.10:5300", 1);
            seen.insert(addresses(&lb.reorder(&state, answers(k))));
        }
        assert_eq!(seen.len(), usize::from(k));

        // The next call starts the cycle over.
        let first = addresses(&lb.reorder(&state_from("192.0.2.10:5300", 1), answers(k)));
        assert_eq!(first, addresses(&answers(k)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stateful_rotation_concurrent() {
        let lb = Arc::new(LoadBalance::new(Policy::StatefulRotate));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lb = lb.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let state = state_from("192.0.2.10:5300", 1);
                        assert_eq!(lb.reorder(&state, answers(3)).len(), 4);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // Every reorder advanced the shared counter exactly once.
        let key = RotationKey::new(&state_from("192.0.2.10:5300", 1));
        assert_eq!(*lb.rotations.get(&key).unwrap(), 8 * 50);

        let next = addresses(&lb.reorder(&state_from("192.0.2.10:5300", 1), answers(3)));
        let mut expected = addresses(&answers(3));
        expected.rotate_left(8 * 50 % 3);
        assert_eq!(next, expected);
    }

    #[test]
    fn test_stateful_rotation_per_subnet() {
        let lb = LoadBalance::new(Policy::StatefulRotate);
        let original = addresses(&answers(3));

        let a = addresses(&lb.reorder(&state_from("192.0.2.10:5300", 1), answers(3)));
        // Same /24, so the rotation advances.
        let b = addresses(&lb.reorder(&state_from("192.0.2.99:5300", 1), answers(3)));
        // Another subnet starts from the beginning.
        let c = addresses(&lb.reorder(&state_from("198.51.100.1:5300", 1), answers(3)));

        assert_eq!(a, original);
        assert_ne!(b, original);
        assert_eq!(c, original);
    }

    #[test]
    fn test_stateless_rotation_follows_id() {
        let lb = LoadBalance::new(Policy::StatelessRotate);
        let mut seen = HashSet::new();
        for id in 100..103 {
            seen.insert(addresses(&lb.reorder(&state_from("192.0.2.10:5300", id), answers(3))));
        }
        assert_eq!(seen.len(), 3);

        let again = addresses(&lb.reorder(&state_from("203.0.113.1:5300", 100), answers(3)));
        let first = addresses(&lb.reorder(&state_from("192.0.2.10:5300", 100), answers(3)));
        assert_eq!(again, first);
    }

    #[test]
    fn test_subnet() {
        assert_eq!(
            subnet("192.0.2.77".parse().unwrap()),
            IpNetwork::from_str("192.0.2.0/24").unwrap()
        );
        assert_eq!(
            subnet("2001:db8:1:2ff::1".parse().unwrap()),
            IpNetwork::from_str("2001:db8:1:200::/56").unwrap()
        );
    }

    #[test]
    fn test_single_address_untouched() {
        let lb = LoadBalance::new(Policy::Random);
        let state = state("www.example.org.", RecordType::A, Transport::Udp);
        let reordered = lb.reorder(&state, answers(1));
        assert_eq!(reordered[0].record_type(), RecordType::A);
        assert_eq!(reordered[1].record_type(), RecordType::CNAME);
    }
}
