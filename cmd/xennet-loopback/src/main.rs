//! xennet End-to-End Loopback Run
//!
//! Drives a `Netfront` against the in-process `LoopbackBackend`:
//!   Part A: Connect. Ring grants, RX refill, link up
//!   Part B: TX. Fragmented frames out, completions back
//!   Part C: RX echo. Every transmitted frame looped back in
//!   Part D: Offloads. Large send out, GSO split on receive
//!   Part E: Shutdown. Every grant revoked
//!
//! Run: XENNET_LOG_LEVEL=debug ./target/release/xennet-loopback
//! (the XENNET_* variables of `NetfrontConfig::from_env` apply)

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use xennet_core::config::{NetfrontConfig, Options, RxSplitPolicy};
use xennet_core::frame::{RxFrame, SendStatus, TxFrame, TxOffload};
use xennet_core::grant::GrantTable;
use xennet_core::logger;
use xennet_core::shim::AdapterShim;
use xennet_core::state::{DeviceState, LinkState};
use xennet_core::wire::{RxFlags, PAGE_SIZE};

use xennet_engine::checksum::{write_ipv4_header_checksum, IPPROTO_TCP};
use xennet_engine::{Drain, Netfront};

use xennet_module::loopback::RxDelivery;
use xennet_module::{DefaultNotifier, EventWait, LocalGrantTable, LoopbackBackend};

const MAC: [u8; 6] = [0x00, 0x16, 0x3e, 0x5a, 0x00, 0x01];
const PEER_MAC: [u8; 6] = [0x00, 0x16, 0x3e, 0x5a, 0x00, 0x02];
const TX_FRAMES: usize = 32;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Shim ──

/// Collects everything the engine reports; the run loop hands RX
/// frames back.
#[derive(Default)]
struct Collector {
    received: Mutex<Vec<RxFrame>>,
    sent: Mutex<Vec<(u64, SendStatus)>>,
    links: Mutex<Vec<LinkState>>,
}

impl AdapterShim for Collector {
    fn on_frame_received(&self, frame: RxFrame) {
        lock(&self.received).push(frame);
    }

    fn on_frame_sent(&self, frame: TxFrame, status: SendStatus) {
        lock(&self.sent).push((frame.tag(), status));
    }

    fn on_link_state_changed(&self, state: LinkState) {
        lock(&self.links).push(state);
    }
}

type Front = Netfront<LocalGrantTable, Arc<DefaultNotifier>, Collector>;
type Back = LoopbackBackend<Arc<DefaultNotifier>>;

// ── Frame builders ──

fn raw_frame(len: usize, seed: usize) -> Vec<u8> {
    let mut f: Vec<u8> = (0..len).map(|i| (i * 31 + seed * 7) as u8).collect();
    f[..6].copy_from_slice(&MAC);
    f[6..12].copy_from_slice(&PEER_MAC);
    f[12..14].copy_from_slice(&0x88b5u16.to_be_bytes());
    f
}

fn tcp_frame(payload: usize) -> Vec<u8> {
    let mut f = Vec::with_capacity(54 + payload);
    f.extend_from_slice(&MAC);
    f.extend_from_slice(&PEER_MAC);
    f.extend_from_slice(&0x0800u16.to_be_bytes());
    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((40 + payload) as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = IPPROTO_TCP;
    ip[12..16].copy_from_slice(&[192, 168, 7, 2]);
    ip[16..20].copy_from_slice(&[192, 168, 7, 1]);
    write_ipv4_header_checksum(&mut ip);
    f.extend_from_slice(&ip);
    let mut tcp = [0u8; 20];
    tcp[0..2].copy_from_slice(&5001u16.to_be_bytes());
    tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
    tcp[4..8].copy_from_slice(&1u32.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = 0x18;
    f.extend_from_slice(&tcp);
    f.extend((0..payload).map(|i| i as u8));
    f
}

/// Pass received frames back to the engine; returns their bytes.
fn drain_received(nf: &Front, shim: &Collector) -> Vec<Vec<u8>> {
    let frames = std::mem::take(&mut *lock(&shim.received));
    let mut out = Vec::with_capacity(frames.len());
    for f in frames {
        out.push(f.to_vec());
        nf.return_rx_buffer(f);
    }
    out
}

fn handle_until_idle(nf: &Front) {
    while nf.handle_event() == Drain::Reschedule {}
}

// ════════════════════════════════════════════════════════════
// Part A: Connect
// ════════════════════════════════════════════════════════════

fn test_connect(
    t: &mut TestRunner,
    nf: &Front,
    grants: &Arc<LocalGrantTable>,
    shim: &Collector,
    to_front: &Arc<DefaultNotifier>,
    target: u32,
) -> Option<Back> {
    t.section("Part A: Connect");

    let (tx_ref, rx_ref) = match nf.connect() {
        Ok(refs) => { t.pass("connect"); refs }
        Err(e) => { t.fail("connect", &e.to_string()); return None; }
    };
    t.check("state Active", nf.state() == DeviceState::Active, &format!("{}", nf.state()));
    t.check("link up reported", lock(&shim.links).as_slice() == [LinkState::Up], "no link callback");
    t.check("ring grants issued", tx_ref != rx_ref && grants.active() >= 2, "ring refs");

    let mut backend = match LoopbackBackend::attach(grants.clone(), tx_ref, rx_ref, to_front.clone()) {
        Ok(b) => { t.pass("backend attach"); b }
        Err(e) => { t.fail("backend attach", &e.to_string()); return None; }
    };
    let offered = backend.rx_available();
    t.check(
        &format!("{} rx buffers offered", target),
        offered == target as usize,
        &format!("got {}", offered),
    );
    Some(backend)
}

// ════════════════════════════════════════════════════════════
// Part B: TX
// ════════════════════════════════════════════════════════════

fn test_tx(t: &mut TestRunner, nf: &Front, backend: &mut Back, shim: &Collector) -> Vec<Vec<u8>> {
    t.section("Part B: TX");

    let frames: Vec<Vec<u8>> = (0..TX_FRAMES).map(|i| raw_frame(60 + i * 281, i)).collect();
    let mut busy = 0;
    for (i, data) in frames.iter().enumerate() {
        let frame = match TxFrame::from_bytes(data, 1500) {
            Ok(f) => f.with_tag(i as u64),
            Err(e) => { t.fail("build tx frame", &e.to_string()); return Vec::new(); }
        };
        // Busy frames stay queued inside the engine.
        if nf.send(frame).is_err() {
            busy += 1;
        }
    }
    println!("       {} sends answered busy", busy);

    let mut captured = Vec::new();
    for _ in 0..64 {
        match backend.process_tx() {
            Ok(c) => captured.extend(c.into_iter().map(|c| c.data)),
            Err(e) => { t.fail("backend process_tx", &e.to_string()); return Vec::new(); }
        }
        nf.handle_event();
        if lock(&shim.sent).len() == TX_FRAMES {
            break;
        }
    }
    t.check(
        &format!("{} frames on the wire", TX_FRAMES),
        captured.len() == TX_FRAMES,
        &format!("got {}", captured.len()),
    );
    t.check("bytes intact", captured == frames, "payload mismatch");

    let sent = std::mem::take(&mut *lock(&shim.sent));
    t.check(
        "all completions Success, in order",
        sent.iter().enumerate().all(|(i, (tag, s))| *tag == i as u64 && *s == SendStatus::Success),
        &format!("{:?}", sent.iter().map(|(_, s)| *s).collect::<Vec<_>>()),
    );
    t.check("tx ring idle", nf.tx_outstanding() == 0, "frames outstanding");
    captured
}

// ════════════════════════════════════════════════════════════
// Part C: RX echo
// ════════════════════════════════════════════════════════════

fn test_rx_echo(t: &mut TestRunner, nf: &Front, backend: &mut Back, shim: &Collector, frames: &[Vec<u8>]) {
    t.section("Part C: RX echo");

    let mut echoed = Vec::new();
    for (i, data) in frames.iter().enumerate() {
        let how = RxDelivery { chunk: if i % 2 == 0 { PAGE_SIZE } else { 1024 }, ..Default::default() };
        let mut delivered = false;
        for _ in 0..4 {
            match backend.deliver(data, &how) {
                Ok(true) => { delivered = true; break; }
                Ok(false) => {
                    handle_until_idle(nf);
                    echoed.extend(drain_received(nf, shim));
                }
                Err(e) => { t.fail("backend deliver", &e.to_string()); return; }
            }
        }
        if !delivered {
            t.fail("backend deliver", "rx ring starved");
            return;
        }
    }
    handle_until_idle(nf);
    echoed.extend(drain_received(nf, shim));

    t.check(
        &format!("{} frames received", frames.len()),
        echoed.len() == frames.len(),
        &format!("got {}", echoed.len()),
    );
    t.check("bytes intact", echoed == frames, "payload mismatch");
    t.check("all buffers returned", nf.rx_outstanding() == 0, "frames held");
    let stats = nf.stats();
    t.check("no rx errors", stats.rx_errors == 0 && stats.rx_dropped == 0, &format!("{:?}", stats));
}

// ════════════════════════════════════════════════════════════
// Part D: Offloads
// ════════════════════════════════════════════════════════════

fn test_offloads(t: &mut TestRunner, nf: &Front, backend: &mut Back, shim: &Collector) {
    t.section("Part D: Offloads");

    let data = tcp_frame(4000);
    let frame = match TxFrame::from_bytes(&data, PAGE_SIZE) {
        Ok(f) => f.with_offload(TxOffload { mss: 1000, ..Default::default() }),
        Err(e) => { t.fail("build lso frame", &e.to_string()); return; }
    };
    if nf.send(frame).is_err() {
        t.fail("lso send", "busy");
        return;
    }
    let captured = match backend.process_tx() {
        Ok(c) => c,
        Err(e) => { t.fail("backend process_tx", &e.to_string()); return; }
    };
    nf.handle_event();
    let Some(lso) = captured.into_iter().next() else {
        t.fail("lso frame on the wire", "nothing captured");
        return;
    };
    t.check("lso carries gso extra", lso.gso_mss == Some(1000), &format!("{:?}", lso.gso_mss));
    t.check("lso payload intact", lso.data[54..] == data[54..], "payload mismatch");
    let sent = std::mem::take(&mut *lock(&shim.sent));
    t.check("lso completed", sent.len() == 1 && sent[0].1 == SendStatus::Success, &format!("{:?}", sent));

    // The same segment back as a 4-segment GSO receive.
    nf.configure(Options { rx_split_policy: RxSplitPolicy::BySegment, ..nf.options() });
    let how = RxDelivery { gso_mss: Some(1000), flags: RxFlags::DATA_VALIDATED, chunk: PAGE_SIZE };
    match backend.deliver(&data, &how) {
        Ok(true) => {}
        Ok(false) => { t.fail("gso deliver", "rx ring starved"); return; }
        Err(e) => { t.fail("gso deliver", &e.to_string()); return; }
    }
    handle_until_idle(nf);
    let split = drain_received(nf, shim);
    t.check("gso split into 4 frames", split.len() == 4, &format!("got {}", split.len()));
    let joined: Vec<u8> = split.iter().flat_map(|f| f[54..].iter().copied()).collect();
    t.check("split payload intact", joined == data[54..], "payload mismatch");
}

// ════════════════════════════════════════════════════════════
// Part E: Shutdown
// ════════════════════════════════════════════════════════════

fn test_shutdown(t: &mut TestRunner, nf: &Front, backend: Back, grants: &LocalGrantTable, shim: &Collector) {
    t.section("Part E: Shutdown");

    backend.detach();
    match nf.shutdown() {
        Ok(()) => t.pass("shutdown"),
        Err(e) => t.fail("shutdown", &e.to_string()),
    }
    t.check("state Disconnected", nf.state() == DeviceState::Disconnected, &format!("{}", nf.state()));
    t.check("every grant revoked", grants.active() == 0, &format!("{} still active", grants.active()));
    t.check(
        "link down reported",
        lock(&shim.links).last() == Some(&LinkState::Down),
        "no link callback",
    );
    t.check("send after shutdown fails", nf.send(TxFrame::new(Vec::new())).is_ok()
        && lock(&shim.sent).last().map(|s| s.1) == Some(SendStatus::Failure), "frame not failed");
}

fn main() {
    logger::init();

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║          xennet End-to-End Loopback Run                  ║");
    println!("╚══════════════════════════════════════════════════════════╝");

    let mut t = TestRunner::new();

    let config = NetfrontConfig::from_env().mac_address(MAC);
    let target = config.rx_target;
    let grants = Arc::new(LocalGrantTable::default());
    let shim = Arc::new(Collector::default());
    let (to_back, to_front) = match (DefaultNotifier::create(), DefaultNotifier::create()) {
        (Ok(b), Ok(f)) => (Arc::new(b), Arc::new(f)),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("notifier: {}", e);
            std::process::exit(1);
        }
    };
    let nf = match Netfront::new(config, grants.clone(), to_back.clone(), shim.clone()) {
        Ok(nf) => nf,
        Err(e) => {
            eprintln!("netfront: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(mut backend) = test_connect(&mut t, &nf, &grants, &shim, &to_front, target) {
        let frames = test_tx(&mut t, &nf, &mut backend, &shim);
        let kicked = matches!(to_back.wait(Duration::ZERO), Ok(true));
        t.check("backend kicked by tx", kicked, "no notification");
        test_rx_echo(&mut t, &nf, &mut backend, &shim, &frames);
        test_offloads(&mut t, &nf, &mut backend, &shim);
        test_shutdown(&mut t, &nf, backend, &grants, &shim);
    }

    let s = nf.stats();
    println!("\n  rx: {} frames {} errors {} filtered", s.rx_packets(), s.rx_errors, s.rx_filtered);
    println!("  tx: {} frames {} errors {} busy", s.tx_packets(), s.tx_errors, s.tx_busy);

    t.summary();
    if t.failed > 0 {
        std::process::exit(1);
    }
}
