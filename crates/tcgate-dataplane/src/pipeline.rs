//! Per-packet forwarding pipeline
//!
//! parse → do-not-track → conntrack → [pre-DNAT → NAT → normal → create]
//! → rewrite → FIB → mark
//!
//! One forward pass, no backtracking. Every stage either hands the packet on
//! or terminates with a [`Reason`]; early exits are `Err(reason)` propagated
//! with `?` and turned into a drop at the top.

use std::sync::Arc;
use tcgate_common::{AttachPoint, FlowTuple, SkbMeta, Timestamp, WorkloadMark};
use tcgate_policy::{PolicyInput, PolicyStage, PolicyStages, PolicyVerdict};

use crate::conntrack::{ConntrackError, ConntrackTable, CtLookup};
use crate::decision::{Decision, FibStatus, Reason};
use crate::fib::{FibError, FibOracle, FibParams};
use crate::nat::NatTable;
use crate::packet::{self, ParseOutcome, ParsedPacket, ETH_DST, ETH_HLEN, ETH_SRC};
use crate::rewrite;
use crate::stats::DataplaneStats;

/// The forwarding decision engine.
///
/// Holds shared handles to the policy stages and the three external stores.
/// `process` takes `&self`, so one `Dataplane` serves any number of threads.
pub struct Dataplane {
    policy: Arc<PolicyStages>,
    conntrack: Arc<dyn ConntrackTable>,
    nat: Arc<dyn NatTable>,
    fib: Arc<dyn FibOracle>,
    mark: WorkloadMark,
    stats: Arc<DataplaneStats>,
}

impl Dataplane {
    /// Create a dataplane with the default workload mark
    pub fn new(
        policy: Arc<PolicyStages>,
        conntrack: Arc<dyn ConntrackTable>,
        nat: Arc<dyn NatTable>,
        fib: Arc<dyn FibOracle>,
    ) -> Self {
        Self {
            policy,
            conntrack,
            nat,
            fib,
            mark: WorkloadMark::default(),
            stats: Arc::new(DataplaneStats::default()),
        }
    }

    /// Use a different origin mark
    pub fn with_mark(mut self, mark: WorkloadMark) -> Self {
        self.mark = mark;
        self
    }

    /// Share an existing stats block
    pub fn with_stats(mut self, stats: Arc<DataplaneStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Policy stages, for hot-swapping programs
    pub fn policy(&self) -> &Arc<PolicyStages> {
        &self.policy
    }

    /// Pipeline counters
    pub fn stats(&self) -> &Arc<DataplaneStats> {
        &self.stats
    }

    /// Origin mark in use
    pub fn mark(&self) -> WorkloadMark {
        self.mark
    }

    /// Run one frame through the pipeline.
    ///
    /// The frame may be rewritten in place (NAT, MAC addresses) and `meta.mark`
    /// may gain the origin tag. Nothing is written once the decision is a drop.
    pub fn process(&self, frame: &mut [u8], meta: &mut SkbMeta, attach: AttachPoint) -> Decision {
        let start = Timestamp::now();
        self.stats.record_rx(frame.len());

        let decision = match self.run(frame, meta, attach) {
            Ok(decision) => decision,
            Err(reason) => {
                tracing::debug!(%attach, %reason, "packet dropped");
                Decision::shot(reason)
            }
        };

        if attach.from_workload() && !decision.is_drop() {
            meta.mark = self.mark.apply(meta.mark);
            self.stats.record_mark();
        }

        self.stats.record_decision(&decision, start.elapsed_nanos());
        tracing::trace!(
            %attach,
            action = decision.action.as_str(),
            reason = %decision.reason,
            "packet processed"
        );
        decision
    }

    fn run(&self, frame: &mut [u8], meta: &SkbMeta, attach: AttachPoint) -> Result<Decision, Reason> {
        let pkt = match packet::parse(frame)? {
            ParseOutcome::NotIpv4 { .. } => return Ok(Decision::unspec(Reason::NotIpv4)),
            ParseOutcome::Ipv4(pkt) => pkt,
        };

        if attach.is_host_endpoint() && attach.is_ingress() && !self.mark.is_set(meta.mark) {
            let input = PolicyInput::new(pkt.tuple, attach);
            match self.policy.evaluate(PolicyStage::DoNotTrack, &input) {
                PolicyVerdict::Allow => {
                    return Ok(self.forward(frame, meta, attach, &pkt, pkt.tuple, Reason::DoNotTrackAllow));
                }
                PolicyVerdict::Deny => return Err(Reason::DoNotTrackDeny),
                PolicyVerdict::NoMatch => {}
            }
        }

        if pkt.proto().is_none() {
            return Err(Reason::UnsupportedProtocol);
        }

        let (tuple, reason) = match self.conntrack.lookup(&pkt.tuple, &pkt.l4) {
            CtLookup::NotFound => {
                self.stats.record_ct_miss();
                return Err(Reason::CtInvalid);
            }
            CtLookup::New => {
                self.stats.record_ct_miss();
                self.open_flow(frame, &pkt, attach)?
            }
            CtLookup::Established => {
                self.stats.record_ct_hit();
                (pkt.tuple, Reason::Established)
            }
            CtLookup::EstablishedDnat(to) => {
                self.stats.record_ct_hit();
                rewrite::rewrite_dst(frame, pkt.tuple.protocol, to)?;
                (pkt.tuple.with_dst(to), Reason::EstablishedDnat)
            }
            CtLookup::EstablishedSnat(to) => {
                self.stats.record_ct_hit();
                rewrite::rewrite_src(frame, pkt.tuple.protocol, to)?;
                (pkt.tuple.with_src(to), Reason::EstablishedSnat)
            }
        };

        Ok(self.forward(frame, meta, attach, &pkt, tuple, reason))
    }

    /// New-flow branch: policy, NAT resolution, conntrack insert and the DNAT
    /// rewrite. Returns the tuple as it leaves the rewriter.
    fn open_flow(
        &self,
        frame: &mut [u8],
        pkt: &ParsedPacket,
        attach: AttachPoint,
    ) -> Result<(FlowTuple, Reason), Reason> {
        let tuple = pkt.tuple;

        let pre_dnat = self
            .policy
            .evaluate(PolicyStage::PreDnat, &PolicyInput::new(tuple, attach));
        if pre_dnat == PolicyVerdict::Deny {
            return Err(Reason::PreDnatDeny);
        }

        let backend = self.nat.resolve(tuple.protocol, tuple.dst_ip, tuple.dst_port);
        let post_nat = backend.map_or(tuple, |to| tuple.with_dst(to));

        // a pre-DNAT allow is final for the policy phase
        if pre_dnat == PolicyVerdict::NoMatch {
            let input = PolicyInput::new(post_nat, attach);
            if self.policy.evaluate(PolicyStage::ApplyOnForward, &input) == PolicyVerdict::Deny {
                return Err(Reason::ApplyOnForwardDeny);
            }
            match self.policy.evaluate(PolicyStage::Normal, &input) {
                PolicyVerdict::Allow => {}
                PolicyVerdict::Deny => return Err(Reason::PolicyDeny),
                PolicyVerdict::NoMatch => return Err(Reason::PolicyNoMatch),
            }
        }

        match backend {
            None => {
                let created = self.conntrack.create(&tuple, &pkt.l4, attach);
                self.settle_insert(created, pkt, CtLookup::Established)?;
                Ok((tuple, Reason::NewFlow))
            }
            Some(to) => {
                let created = self.conntrack.create_with_nat(&tuple, &pkt.l4, to, attach);
                self.settle_insert(created, pkt, CtLookup::EstablishedDnat(to))?;
                self.stats.record_nat_hit();
                rewrite::rewrite_dst(frame, tuple.protocol, to)?;
                Ok((post_nat, Reason::NewFlowNat))
            }
        }
    }

    /// Map an insert outcome to go / no-go. A lost race is survivable when the
    /// winner resolves this packet the way we would have.
    fn settle_insert(
        &self,
        created: Result<(), ConntrackError>,
        pkt: &ParsedPacket,
        expected: CtLookup,
    ) -> Result<(), Reason> {
        match created {
            Ok(()) => {
                self.stats.record_ct_create();
                Ok(())
            }
            Err(ConntrackError::TableFull) => {
                tracing::warn!(flow = %pkt.tuple, "connection table full");
                Err(Reason::TableFull)
            }
            Err(ConntrackError::InsertRace) => {
                self.stats.record_ct_race();
                let winner = self.conntrack.peek(&pkt.tuple, &pkt.l4);
                if winner == expected {
                    tracing::debug!(flow = %pkt.tuple, "lost insert race, following winner");
                    Ok(())
                } else {
                    tracing::warn!(flow = %pkt.tuple, ?winner, ?expected, "conflicting connection entry");
                    Err(Reason::InsertRace)
                }
            }
        }
    }

    /// Forwarding step for accepted packets
    fn forward(
        &self,
        frame: &mut [u8],
        meta: &SkbMeta,
        attach: AttachPoint,
        pkt: &ParsedPacket,
        tuple: FlowTuple,
        reason: Reason,
    ) -> Decision {
        if !attach.towards_host() {
            return Decision::unspec(reason);
        }

        let params = FibParams {
            protocol: tuple.protocol,
            src_ip: tuple.src_ip,
            dst_ip: tuple.dst_ip,
            src_port: tuple.src_port,
            dst_port: tuple.dst_port,
            ifindex: meta.ingress_ifindex,
            tot_len: pkt.ip_tot_len,
        };

        match self.fib.lookup(&params) {
            Ok(hop) => {
                let Some(eth) = frame.get_mut(..ETH_HLEN) else {
                    return Decision::shot(Reason::Malformed);
                };
                eth[ETH_DST..ETH_DST + 6].copy_from_slice(&hop.dmac.0);
                eth[ETH_SRC..ETH_SRC + 6].copy_from_slice(&hop.smac.0);
                Decision::redirect(hop.ifindex, reason)
            }
            Err(FibError::BadInput(why)) => {
                tracing::debug!(flow = %tuple, why, "FIB rejected lookup, falling back");
                Decision::fallback(reason, FibStatus::BadInput)
            }
            Err(FibError::NoRoute(dst)) => {
                tracing::debug!(flow = %tuple, %dst, "no FIB route, falling back");
                Decision::fallback(reason, FibStatus::NoRoute)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::verify_checksums;
    use crate::conntrack::ConntrackMap;
    use crate::decision::TcAction;
    use crate::fib::{FibResult, MacAddr, Route, StaticFib};
    use crate::nat::NatMap;
    use crate::packet::testutil::*;
    use crate::packet::{L4Header, TcpFlags, ICMP_ECHO, L3_OFF};
    use parking_lot::Mutex;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tcgate_common::IpProto;
    use tcgate_policy::{PolicyRule, RuleProgram};

    const HOST_IF: u32 = 2;
    const CLIENT_IF: u32 = 3;
    const BACKEND_IF: u32 = 5;
    const HOST_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
    const CLIENT_VETH: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x03]);
    const BACKEND_VETH: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x05]);
    const BACKEND_MAC: MacAddr = MacAddr([0x0a, 0, 0, 0, 0x01, 0x07]);

    /// Static FIB that also remembers what it was asked
    struct RecordingFib {
        inner: StaticFib,
        seen: Mutex<Vec<FibParams>>,
    }

    impl FibOracle for RecordingFib {
        fn lookup(&self, params: &FibParams) -> Result<FibResult, FibError> {
            self.seen.lock().push(*params);
            self.inner.lookup(params)
        }
    }

    struct Harness {
        dp: Dataplane,
        ct: Arc<ConntrackMap>,
        nat: Arc<NatMap>,
        fib: Arc<RecordingFib>,
        policy: Arc<PolicyStages>,
    }

    fn harness() -> Harness {
        let fib = StaticFib::new();
        fib.add_interface(HOST_IF, HOST_MAC);
        fib.add_interface(CLIENT_IF, CLIENT_VETH);
        fib.add_interface(BACKEND_IF, BACKEND_VETH);
        fib.add_route(Route {
            dest: "10.0.1.0/24".parse().unwrap(),
            ifindex: BACKEND_IF,
            gateway: None,
        });
        fib.add_neighbor(Ipv4Addr::new(10, 0, 1, 7), BACKEND_MAC);
        let fib = Arc::new(RecordingFib {
            inner: fib,
            seen: Mutex::new(Vec::new()),
        });

        let policy = Arc::new(PolicyStages::new());
        let ct = Arc::new(ConntrackMap::new(1024));
        let nat = Arc::new(NatMap::new());
        let dp = Dataplane::new(policy.clone(), ct.clone(), nat.clone(), fib.clone());
        Harness { dp, ct, nat, fib, policy }
    }

    fn allow_all(stages: &PolicyStages, stage: PolicyStage) {
        stages.install(stage, "allow-all", RuleProgram::new(vec![PolicyRule::allow(1)]).unwrap());
    }

    fn deny_all(stages: &PolicyStages, stage: PolicyStage) {
        stages.install(stage, "deny-all", RuleProgram::new(vec![PolicyRule::deny(1)]).unwrap());
    }

    fn client() -> FlowTuple {
        tuple(IpProto::Tcp, [10, 0, 0, 5], 43210, [10, 0, 0, 100], 80)
    }

    fn vip() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 100), 80)
    }

    fn backend() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 7), 8080)
    }

    fn wire_tuple(frame: &[u8]) -> FlowTuple {
        match packet::parse(frame) {
            Ok(ParseOutcome::Ipv4(p)) => p.tuple,
            other => panic!("unexpected parse result {:?}", other),
        }
    }

    fn run(h: &Harness, frame: &mut [u8], ifindex: u32, attach: AttachPoint) -> (Decision, SkbMeta) {
        let mut meta = SkbMeta::new(ifindex);
        let decision = h.dp.process(frame, &mut meta, attach);
        (decision, meta)
    }

    #[test]
    fn test_tcp_syn_dnat_redirect() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);
        h.nat.insert(IpProto::Tcp, vip(), backend());

        let mut frame = tcp(&client(), TcpFlags::SYN);
        let (decision, meta) = run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);

        assert_eq!(decision, Decision::redirect(BACKEND_IF, Reason::NewFlowNat));
        assert_eq!(wire_tuple(&frame), client().with_dst(backend()));
        assert!(verify_checksums(&frame));
        assert_eq!(&frame[ETH_DST..ETH_DST + 6], &BACKEND_MAC.0);
        assert_eq!(&frame[ETH_SRC..ETH_SRC + 6], &BACKEND_VETH.0);

        // oracle saw the rewritten tuple
        let seen = h.fib.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].dst_ip, *backend().ip());
        assert_eq!(seen[0].dst_port, backend().port());
        assert_eq!(seen[0].ifindex, CLIENT_IF);
        assert_eq!(seen[0].tot_len as usize, frame.len() - ETH_HLEN);

        assert_eq!(h.ct.len(), 2);
        assert_eq!(h.ct.lookup(&client(), &L4Header::Tcp { flags: TcpFlags::ACK }), CtLookup::EstablishedDnat(backend()));
        assert!(h.dp.mark().is_set(meta.mark));
    }

    #[test]
    fn test_identity_nat_frontend() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);
        // backend answers on the frontend address itself
        h.nat.insert(IpProto::Tcp, vip(), vip());

        let mut syn = tcp(&client(), TcpFlags::SYN);
        let (decision, _) = run(&h, &mut syn, HOST_IF, AttachPoint::ToWorkload);
        assert_eq!(decision, Decision::unspec(Reason::NewFlowNat));
        assert_eq!(wire_tuple(&syn), client());
        assert!(verify_checksums(&syn));
        assert_eq!(h.ct.len(), 1);
        assert_eq!(h.dp.stats().snapshot().ct_races, 0);

        let reply = client().reverse();
        let mut frame = tcp(&reply, TcpFlags::SYN.union(TcpFlags::ACK));
        let (decision, _) = run(&h, &mut frame, HOST_IF, AttachPoint::ToWorkload);
        assert_eq!(decision, Decision::unspec(Reason::Established));
        assert_eq!(wire_tuple(&frame), reply);

        let mut ack = tcp(&client(), TcpFlags::ACK);
        let (decision, _) = run(&h, &mut ack, HOST_IF, AttachPoint::ToWorkload);
        assert_eq!(decision, Decision::unspec(Reason::EstablishedDnat));
        assert_eq!(wire_tuple(&ack), client());
    }

    #[test]
    fn test_one_way_nat_flow_survives_expiry() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);
        let dns_vip = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 100), 53);
        let dns = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 7), 53);
        h.nat.insert(IpProto::Udp, dns_vip, dns);

        let query = tuple(IpProto::Udp, [10, 0, 0, 5], 5353, [10, 0, 0, 100], 53);
        let mut frame = udp(&query);
        run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(h.ct.len(), 2);

        thread::sleep(Duration::from_millis(2));
        let cutoff = Timestamp::now().as_nanos();
        thread::sleep(Duration::from_millis(2));

        // client keeps sending; nothing has come back yet
        let mut frame = udp(&query);
        let (decision, _) = run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::redirect(BACKEND_IF, Reason::EstablishedDnat));

        assert_eq!(h.ct.expire_older_than(cutoff), 0);
        assert_eq!(h.ct.len(), 2);

        let answer = query.with_dst(dns).reverse();
        let mut frame = udp(&answer);
        let (decision, _) = run(&h, &mut frame, HOST_IF, AttachPoint::ToWorkload);
        assert_eq!(decision, Decision::unspec(Reason::EstablishedSnat));
        assert_eq!(wire_tuple(&frame).src(), dns_vip);
    }

    #[test]
    fn test_established_dnat_and_snat_reply() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);
        h.nat.insert(IpProto::Tcp, vip(), backend());

        let mut syn = tcp(&client(), TcpFlags::SYN);
        run(&h, &mut syn, CLIENT_IF, AttachPoint::FromWorkload);

        // reply from the backend towards the client workload
        let reply = client().with_dst(backend()).reverse();
        let mut frame = tcp(&reply, TcpFlags::SYN.union(TcpFlags::ACK));
        let (decision, meta) = run(&h, &mut frame, HOST_IF, AttachPoint::ToWorkload);

        assert_eq!(decision, Decision::unspec(Reason::EstablishedSnat));
        assert_eq!(wire_tuple(&frame), reply.with_src(vip()));
        assert!(verify_checksums(&frame));
        assert_eq!(meta.mark, 0);

        // next client segment keeps the translation
        let mut ack = tcp(&client(), TcpFlags::ACK);
        let (decision, _) = run(&h, &mut ack, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::redirect(BACKEND_IF, Reason::EstablishedDnat));
        assert_eq!(wire_tuple(&ack), client().with_dst(backend()));
        assert!(verify_checksums(&ack));

        // policy was consulted once, for the SYN
        let normal = &h.policy.stats()[PolicyStage::Normal as usize];
        assert_eq!(normal.allowed, 1);
    }

    #[test]
    fn test_default_deny() {
        let h = harness();
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 5000, [10, 0, 1, 7], 53);
        let mut frame = udp(&t);
        let before = frame.clone();

        let (decision, meta) = run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);

        assert_eq!(decision, Decision::shot(Reason::PolicyNoMatch));
        assert_eq!(frame, before);
        assert!(h.ct.is_empty());
        assert_eq!(meta.mark, 0);
        assert!(h.fib.seen.lock().is_empty());
    }

    #[test]
    fn test_icmp_echo_no_match_denied() {
        let h = harness();
        let t = tuple(IpProto::Icmp, [10, 0, 0, 5], 0, [10, 0, 1, 7], 0);
        let mut frame = icmp(&t, ICMP_ECHO);

        let (decision, _) = run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::PolicyNoMatch));
    }

    #[test]
    fn test_icmp_nat_round_trip() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);
        let vip = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 100), 0);
        let real = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 7), 0);
        h.nat.insert(IpProto::Icmp, vip, real);

        let t = tuple(IpProto::Icmp, [10, 0, 0, 5], 0, [10, 0, 0, 100], 0);
        let mut echo = icmp(&t, ICMP_ECHO);
        let (decision, _) = run(&h, &mut echo, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision.reason, Reason::NewFlowNat);
        assert_eq!(wire_tuple(&echo).dst_ip, *real.ip());
        assert!(verify_checksums(&echo));

        let mut reply = icmp(&t.with_dst(real).reverse(), crate::packet::ICMP_ECHOREPLY);
        let (decision, _) = run(&h, &mut reply, HOST_IF, AttachPoint::ToWorkload);
        assert_eq!(decision, Decision::unspec(Reason::EstablishedSnat));
        assert_eq!(wire_tuple(&reply).src_ip, *vip.ip());
    }

    #[test]
    fn test_malformed_frames() {
        let h = harness();
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 5000, [10, 0, 1, 7], 53);
        let mut short = udp(&t)[..30].to_vec();
        let (decision, _) = run(&h, &mut short, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::Malformed));

        let mut short_tcp = tcp(&client(), TcpFlags::SYN)[..48].to_vec();
        let (decision, _) = run(&h, &mut short_tcp, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::Malformed));

        let mut options = udp(&t);
        options[L3_OFF] = 0x46;
        let (decision, _) = run(&h, &mut options, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::IpOptions));
    }

    #[test]
    fn test_non_ipv4_passthrough() {
        let h = harness();
        let mut arp = vec![0u8; 42];
        arp[12] = 0x08;
        arp[13] = 0x06;
        let before = arp.clone();

        let mut meta = SkbMeta { ingress_ifindex: CLIENT_IF, mark: 0x0000_00ff };
        let decision = h.dp.process(&mut arp, &mut meta, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::unspec(Reason::NotIpv4));
        assert_eq!(arp, before);
        assert_eq!(meta.mark, h.dp.mark().apply(0x0000_00ff));
        assert_eq!(meta.mark & 0xff, 0xff);

        let (decision, meta) = run(&h, &mut arp, HOST_IF, AttachPoint::FromHostEndpoint);
        assert_eq!(decision.action, TcAction::Unspec);
        assert_eq!(meta.mark, 0);
    }

    #[test]
    fn test_do_not_track_allow_bypasses_conntrack_and_nat() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::DoNotTrack);
        h.nat.insert(IpProto::Tcp, SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 7), 80), backend());

        // a mid-stream ACK would be invalid for conntrack
        let t = tuple(IpProto::Tcp, [192, 168, 0, 9], 40000, [10, 0, 1, 7], 80);
        let mut frame = tcp(&t, TcpFlags::ACK);
        let (decision, _) = run(&h, &mut frame, HOST_IF, AttachPoint::FromHostEndpoint);

        assert_eq!(decision, Decision::redirect(BACKEND_IF, Reason::DoNotTrackAllow));
        assert!(h.ct.is_empty());
        assert_eq!(wire_tuple(&frame), t);
        assert!(verify_checksums(&frame));
        assert_eq!(h.fib.seen.lock()[0].dst_port, 80);
    }

    #[test]
    fn test_do_not_track_deny() {
        let h = harness();
        deny_all(&h.policy, PolicyStage::DoNotTrack);
        allow_all(&h.policy, PolicyStage::Normal);
        let t = tuple(IpProto::Udp, [192, 168, 0, 9], 40000, [10, 0, 1, 7], 53);

        let (decision, _) = run(&h, &mut udp(&t), HOST_IF, AttachPoint::FromHostEndpoint);
        assert_eq!(decision, Decision::shot(Reason::DoNotTrackDeny));

        // only host-endpoint ingress consults do-not-track
        let (decision, _) = run(&h, &mut udp(&t), HOST_IF, AttachPoint::ToHostEndpoint);
        assert_eq!(decision, Decision::unspec(Reason::NewFlow));
    }

    #[test]
    fn test_do_not_track_skipped_for_workload_marked() {
        let h = harness();
        deny_all(&h.policy, PolicyStage::DoNotTrack);
        allow_all(&h.policy, PolicyStage::Normal);
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 40000, [10, 0, 1, 7], 53);

        let mut meta = SkbMeta {
            ingress_ifindex: HOST_IF,
            mark: h.dp.mark().apply(0),
        };
        let decision = h.dp.process(&mut udp(&t), &mut meta, AttachPoint::FromHostEndpoint);
        assert_eq!(decision, Decision::redirect(BACKEND_IF, Reason::NewFlow));
    }

    #[test]
    fn test_pre_dnat_allow_skips_normal() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::PreDnat);
        deny_all(&h.policy, PolicyStage::Normal);
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 40000, [10, 0, 1, 7], 53);

        let (decision, _) = run(&h, &mut udp(&t), CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::redirect(BACKEND_IF, Reason::NewFlow));
        assert_eq!(h.policy.stats()[PolicyStage::Normal as usize].denied, 0);
    }

    #[test]
    fn test_pre_dnat_deny() {
        let h = harness();
        deny_all(&h.policy, PolicyStage::PreDnat);
        allow_all(&h.policy, PolicyStage::Normal);
        h.nat.insert(IpProto::Tcp, vip(), backend());

        let mut frame = tcp(&client(), TcpFlags::SYN);
        let before = frame.clone();
        let (decision, _) = run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);

        assert_eq!(decision, Decision::shot(Reason::PreDnatDeny));
        assert_eq!(frame, before);
        assert!(h.ct.is_empty());
    }

    #[test]
    fn test_apply_on_forward_disabled_by_default() {
        let h = harness();
        deny_all(&h.policy, PolicyStage::ApplyOnForward);
        allow_all(&h.policy, PolicyStage::Normal);
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 40000, [10, 0, 1, 7], 53);

        let (decision, _) = run(&h, &mut udp(&t), CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision.reason, Reason::NewFlow);

        h.policy.set_enabled(PolicyStage::ApplyOnForward, true);
        let t = t.with_src(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 40001));
        let (decision, _) = run(&h, &mut udp(&t), CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::ApplyOnForwardDeny));
    }

    #[test]
    fn test_normal_policy_sees_post_nat_destination() {
        let h = harness();
        let backend = backend();
        h.policy.install(PolicyStage::Normal, "backend-only", move |input: &PolicyInput| {
            if input.tuple.dst() == backend {
                PolicyVerdict::Allow
            } else {
                PolicyVerdict::NoMatch
            }
        });

        // without NAT the VIP is not allowed
        let (decision, _) = run(&h, &mut tcp(&client(), TcpFlags::SYN), CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::PolicyNoMatch));

        h.nat.insert(IpProto::Tcp, vip(), backend);
        let (decision, _) = run(&h, &mut tcp(&client(), TcpFlags::SYN), CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision.reason, Reason::NewFlowNat);
    }

    #[test]
    fn test_tcp_without_syn_is_invalid() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);

        let (decision, _) = run(&h, &mut tcp(&client(), TcpFlags::ACK), CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::CtInvalid));
        assert!(h.ct.is_empty());
    }

    #[test]
    fn test_unsupported_protocol() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);
        let gre = FlowTuple::new(47, Ipv4Addr::new(192, 168, 0, 9), 0, Ipv4Addr::new(10, 0, 1, 7), 0);

        let mut frame = build_frame(&gre, L4Header::Other, &[0u8; 16]);
        let (decision, _) = run(&h, &mut frame, HOST_IF, AttachPoint::FromHostEndpoint);
        assert_eq!(decision, Decision::shot(Reason::UnsupportedProtocol));

        allow_all(&h.policy, PolicyStage::DoNotTrack);
        let (decision, _) = run(&h, &mut frame, HOST_IF, AttachPoint::FromHostEndpoint);
        assert_eq!(decision, Decision::redirect(BACKEND_IF, Reason::DoNotTrackAllow));
    }

    #[test]
    fn test_fib_fallbacks() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);

        // no neighbour for .8
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 40000, [10, 0, 1, 8], 53);
        let mut frame = udp(&t);
        let eth_before = frame[..ETH_HLEN].to_vec();
        let (decision, meta) = run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::fallback(Reason::NewFlow, FibStatus::NoRoute));
        assert_eq!(&frame[..ETH_HLEN], &eth_before[..]);
        assert!(h.dp.mark().is_set(meta.mark));

        // unknown ingress interface
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 40001, [10, 0, 1, 7], 53);
        let (decision, _) = run(&h, &mut udp(&t), 0, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::fallback(Reason::NewFlow, FibStatus::BadInput));

        let snap = h.dp.stats().snapshot();
        assert_eq!(snap.fib_no_route, 1);
        assert_eq!(snap.fib_bad_input, 1);
    }

    #[test]
    fn test_table_full_denies() {
        let fib = Arc::new(StaticFib::new());
        let policy = Arc::new(PolicyStages::new());
        allow_all(&policy, PolicyStage::Normal);
        let dp = Dataplane::new(policy, Arc::new(ConntrackMap::new(0)), Arc::new(NatMap::new()), fib);

        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 40000, [10, 0, 1, 7], 53);
        let mut meta = SkbMeta::new(CLIENT_IF);
        let decision = dp.process(&mut udp(&t), &mut meta, AttachPoint::FromWorkload);
        assert_eq!(decision, Decision::shot(Reason::TableFull));
        assert_eq!(meta.mark, 0);
    }

    /// Table that always loses the insert race to a fixed winner
    struct LosingTable {
        winner: CtLookup,
        lookups: AtomicUsize,
    }

    impl ConntrackTable for LosingTable {
        fn lookup(&self, _: &FlowTuple, _: &L4Header) -> CtLookup {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            CtLookup::New
        }

        fn peek(&self, _: &FlowTuple, _: &L4Header) -> CtLookup {
            self.winner
        }

        fn create(&self, _: &FlowTuple, _: &L4Header, _: AttachPoint) -> Result<(), ConntrackError> {
            Err(ConntrackError::InsertRace)
        }

        fn create_with_nat(
            &self,
            _: &FlowTuple,
            _: &L4Header,
            _: SocketAddrV4,
            _: AttachPoint,
        ) -> Result<(), ConntrackError> {
            Err(ConntrackError::InsertRace)
        }
    }

    fn losing_dataplane(winner: CtLookup) -> (Dataplane, Arc<LosingTable>) {
        let policy = Arc::new(PolicyStages::new());
        allow_all(&policy, PolicyStage::Normal);
        let nat = Arc::new(NatMap::new());
        nat.insert(IpProto::Tcp, vip(), backend());
        let table = Arc::new(LosingTable {
            winner,
            lookups: AtomicUsize::new(0),
        });
        let dp = Dataplane::new(policy, table.clone(), nat, Arc::new(StaticFib::new()));
        (dp, table)
    }

    #[test]
    fn test_lost_race_follows_matching_winner() {
        let (dp, table) = losing_dataplane(CtLookup::EstablishedDnat(backend()));
        let mut frame = tcp(&client(), TcpFlags::SYN);
        let mut meta = SkbMeta::new(CLIENT_IF);

        let decision = dp.process(&mut frame, &mut meta, AttachPoint::ToWorkload);
        assert_eq!(decision, Decision::unspec(Reason::NewFlowNat));
        assert_eq!(wire_tuple(&frame), client().with_dst(backend()));
        assert_eq!(dp.stats().snapshot().ct_races, 1);
        // the winner is read back without counting as a second packet
        assert_eq!(table.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lost_race_conflicting_winner_denied() {
        let (dp, table) = losing_dataplane(CtLookup::Established);
        let mut frame = tcp(&client(), TcpFlags::SYN);
        let before = frame.clone();
        let mut meta = SkbMeta::new(CLIENT_IF);

        let decision = dp.process(&mut frame, &mut meta, AttachPoint::ToWorkload);
        assert_eq!(decision, Decision::shot(Reason::InsertRace));
        assert_eq!(frame, before);
        assert_eq!(table.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_syns_same_flow() {
        let h = Arc::new(harness());
        allow_all(&h.policy, PolicyStage::Normal);
        h.nat.insert(IpProto::Tcp, vip(), backend());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                thread::spawn(move || {
                    let mut frame = tcp(&client(), TcpFlags::SYN);
                    let (decision, _) = run(&h, &mut frame, CLIENT_IF, AttachPoint::FromWorkload);
                    (decision, wire_tuple(&frame))
                })
            })
            .collect();

        for handle in handles {
            let (decision, wire) = handle.join().unwrap();
            assert!(!decision.is_drop(), "dropped: {:?}", decision);
            assert_eq!(wire, client().with_dst(backend()));
        }
        assert_eq!(h.ct.len(), 2);
    }

    #[test]
    fn test_stats_accounting() {
        let h = harness();
        allow_all(&h.policy, PolicyStage::Normal);
        let t = tuple(IpProto::Udp, [10, 0, 0, 5], 40000, [10, 0, 1, 7], 53);

        run(&h, &mut udp(&t), CLIENT_IF, AttachPoint::FromWorkload);
        run(&h, &mut udp(&t), CLIENT_IF, AttachPoint::FromWorkload);
        run(&h, &mut tcp(&client(), TcpFlags::ACK), CLIENT_IF, AttachPoint::FromWorkload);

        let snap = h.dp.stats().snapshot();
        assert_eq!(snap.rx_packets, 3);
        assert_eq!(snap.redirected, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.ct_creates, 1);
        assert_eq!(snap.ct_hits, 1);
        assert_eq!(snap.ct_misses, 2);
        assert_eq!(snap.marked, 2);
        assert_eq!(snap.reasons.get("ct_invalid"), Some(&1));
    }
}
