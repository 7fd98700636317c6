use anyhow::{anyhow, Result};
use image::Rgb;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image_sender::controller::is_unknown_source;
use image_sender::{
    Controller, Dimensions, FrameEncoder, FrameSource, FrameTransport, GeneratorConfig,
    PixelGrid, SourceRegistry, SwitchOutcome,
};

const TOPIC: &str = "/frames";
const BLANK: u8 = 0;

// ----------------------------------------------------------------------------
// Probes
// ----------------------------------------------------------------------------

/// Lifecycle bookkeeping shared by every probe in a test.
#[derive(Clone, Default)]
struct Ledger {
    active_now: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Ledger {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }
}

#[derive(Clone, Copy)]
enum Content {
    /// Every frame carries the same value.
    Solid(u8),
    /// Frame values count up from 1, wrapping past 255 back to 1.
    Counter,
}

struct Probe {
    name: &'static str,
    content: Content,
    ledger: Ledger,
    active: bool,
    frames: u64,
    fail_activate: bool,
    /// Activation fails once this many activations have succeeded.
    activation_limit: Option<usize>,
    activations: usize,
    /// Produce fails exactly once, on this frame index.
    fail_on_frame: Option<u64>,
}

impl Probe {
    fn solid(name: &'static str, value: u8, ledger: &Ledger) -> Self {
        Self {
            name,
            content: Content::Solid(value),
            ledger: ledger.clone(),
            active: false,
            frames: 0,
            fail_activate: false,
            activation_limit: None,
            activations: 0,
            fail_on_frame: None,
        }
    }
}

impl FrameSource for Probe {
    fn name(&self) -> &str {
        self.name
    }

    fn dimensions(&self) -> Dimensions {
        Dimensions::new(2, 2)
    }

    fn activate(&mut self) -> Result<()> {
        if self.fail_activate || self.activation_limit == Some(self.activations) {
            self.ledger.record(format!("activate-failed:{}", self.name));
            return Err(anyhow!("{} refuses to start", self.name));
        }
        self.ledger.record(format!("activate:{}", self.name));
        self.activations += 1;
        if !self.active {
            self.active = true;
            let now = self.ledger.active_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.ledger.max_active.fetch_max(now, Ordering::SeqCst);
        }
        Ok(())
    }

    fn produce_frame(&mut self) -> Result<PixelGrid> {
        if !self.active {
            return Err(anyhow!("{} produced while inactive", self.name));
        }
        let index = self.frames;
        self.frames += 1;
        if self.fail_on_frame == Some(index) {
            return Err(anyhow!("{} glitched", self.name));
        }
        let value = match self.content {
            Content::Solid(value) => value,
            Content::Counter => (index % 255) as u8 + 1,
        };
        Ok(PixelGrid::from_pixel(2, 2, Rgb([value, 0, 0])))
    }

    fn deactivate(&mut self) -> Result<()> {
        self.ledger.record(format!("deactivate:{}", self.name));
        if self.active {
            self.active = false;
            self.ledger.active_now.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Encodes a grid as its top-left red value, so blanks decode to `BLANK`.
struct ValueEncoder;

impl FrameEncoder for ValueEncoder {
    fn encode(&self, grid: &PixelGrid) -> Result<Vec<u8>> {
        Ok(vec![grid.get_pixel(0, 0).0[0]])
    }
}

#[derive(Clone, Default)]
struct RecordingTransport {
    messages: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicUsize>,
}

impl RecordingTransport {
    fn values(&self) -> Vec<u8> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|message| {
                assert!(message.starts_with(TOPIC.as_bytes()));
                message[TOPIC.len()]
            })
            .collect()
    }
}

impl FrameTransport for RecordingTransport {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn controller_with(probes: Vec<Probe>) -> Result<Controller> {
    let mut registry = SourceRegistry::new();
    for probe in probes {
        registry.register(probe)?;
    }
    Ok(Controller::new(
        registry,
        GeneratorConfig {
            target_fps: 200,
            ..GeneratorConfig::default()
        },
        Arc::new(ValueEncoder),
        TOPIC,
        10_000,
    ))
}

fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn wait_for_value(transport: &RecordingTransport, value: u8, count: usize) {
    wait_until(&format!("{} frames of value {}", count, value), || {
        transport.values().iter().filter(|v| **v == value).count() >= count
    });
}

/// Collapse consecutive equal values into `(value, run length)`.
fn runs(values: &[u8]) -> Vec<(u8, usize)> {
    let mut runs: Vec<(u8, usize)> = Vec::new();
    for &value in values {
        match runs.last_mut() {
            Some((last, len)) if *last == value => *len += 1,
            _ => runs.push((value, 1)),
        }
    }
    runs
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[test]
fn switch_inserts_two_blanks_and_unknown_switch_changes_nothing() -> Result<()> {
    let ledger = Ledger::default();
    let mut controller = controller_with(vec![
        Probe::solid("A", 10, &ledger),
        Probe::solid("B", 20, &ledger),
    ])?;
    let transport = RecordingTransport::default();
    controller.start("A", Box::new(transport.clone()))?;
    wait_for_value(&transport, 10, 5);

    assert_eq!(controller.switch_source("B")?, SwitchOutcome::Switched);
    wait_for_value(&transport, 20, 5);

    let err = controller.switch_source("C").unwrap_err();
    assert!(is_unknown_source(&err));
    assert_eq!(controller.current_source(), Some("B"));
    let before = transport.values().len();
    wait_until("more B frames", || transport.values().len() > before + 5);

    controller.stop()?;

    let runs = runs(&transport.values());
    assert_eq!(runs.len(), 4, "unexpected stream shape: {:?}", runs);
    assert_eq!(runs[0], (BLANK, 2));
    assert_eq!(runs[1].0, 10);
    assert_eq!(runs[2], (BLANK, 2));
    assert_eq!(runs[3].0, 20);
    assert!(!ledger.calls().iter().any(|c| c.ends_with(":C")));
    assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn at_most_one_source_is_active() -> Result<()> {
    let ledger = Ledger::default();
    let mut controller = controller_with(vec![
        Probe::solid("A", 10, &ledger),
        Probe::solid("B", 20, &ledger),
        Probe::solid("C", 30, &ledger),
    ])?;
    controller.start("A", Box::new(RecordingTransport::default()))?;
    for name in ["B", "C", "A", "C", "B"] {
        controller.switch_source(name)?;
        assert_eq!(ledger.active_now.load(Ordering::SeqCst), 1);
    }
    controller.stop()?;

    assert_eq!(ledger.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.active_now.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn switching_to_active_source_is_a_no_op() -> Result<()> {
    let ledger = Ledger::default();
    let mut controller = controller_with(vec![Probe::solid("A", 10, &ledger)])?;
    let transport = RecordingTransport::default();
    controller.start("A", Box::new(transport.clone()))?;
    wait_for_value(&transport, 10, 3);

    let calls_before = ledger.calls();
    assert_eq!(controller.switch_source("A")?, SwitchOutcome::AlreadyActive);
    assert_eq!(ledger.calls(), calls_before);

    let before = transport.values().len();
    wait_until("more A frames", || transport.values().len() > before + 5);
    controller.stop()?;

    let blanks = transport.values().iter().filter(|v| **v == BLANK).count();
    assert_eq!(blanks, 2);
    Ok(())
}

#[test]
fn failed_activation_restores_previous_source() -> Result<()> {
    let ledger = Ledger::default();
    let mut broken = Probe::solid("Broken", 40, &ledger);
    broken.fail_activate = true;
    let mut controller = controller_with(vec![Probe::solid("A", 10, &ledger), broken])?;
    let transport = RecordingTransport::default();
    controller.start("A", Box::new(transport.clone()))?;
    wait_for_value(&transport, 10, 3);

    let err = controller.switch_source("Broken").unwrap_err();
    assert!(!is_unknown_source(&err));
    assert!(format!("{:#}", err).contains("refuses to start"));
    assert_eq!(controller.current_source(), Some("A"));
    assert_eq!(controller.status().loop_state, "running");

    let before = transport.values().len();
    wait_until("A to resume", || transport.values().len() > before + 5);
    controller.stop()?;

    assert_eq!(
        ledger.calls(),
        vec![
            "activate:A",
            "deactivate:A",
            "activate-failed:Broken",
            "deactivate:Broken",
            "activate:A",
            "deactivate:A",
        ]
    );
    assert!(!transport.values().contains(&40));
    Ok(())
}

#[test]
fn failed_rollback_leaves_loop_recoverable_by_switch() -> Result<()> {
    let ledger = Ledger::default();
    let mut fragile = Probe::solid("A", 10, &ledger);
    fragile.activation_limit = Some(1);
    let mut broken = Probe::solid("Broken", 40, &ledger);
    broken.fail_activate = true;
    let mut controller = controller_with(vec![
        fragile,
        broken,
        Probe::solid("C", 30, &ledger),
    ])?;
    let transport = RecordingTransport::default();
    controller.start("A", Box::new(transport.clone()))?;
    wait_for_value(&transport, 10, 3);

    let err = controller.switch_source("Broken").unwrap_err();
    assert!(format!("{:#}", err).contains("restoring 'A' also failed"));
    assert_eq!(controller.current_source(), None);
    assert_eq!(controller.status().loop_state, "idle");

    assert_eq!(controller.switch_source("C")?, SwitchOutcome::Switched);
    assert_eq!(controller.current_source(), Some("C"));
    assert_eq!(controller.status().loop_state, "running");
    wait_for_value(&transport, 30, 3);
    controller.stop()?;

    assert_eq!(ledger.active_now.load(Ordering::SeqCst), 0);
    assert_eq!(ledger.max_active.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn switch_before_start_is_rejected() -> Result<()> {
    let ledger = Ledger::default();
    let mut controller = controller_with(vec![Probe::solid("A", 10, &ledger)])?;
    let err = controller.switch_source("A").unwrap_err();
    assert!(err.to_string().contains("not running"));
    assert!(ledger.calls().is_empty());
    Ok(())
}

#[test]
fn production_error_faults_loop_until_next_switch() -> Result<()> {
    let ledger = Ledger::default();
    let mut fragile = Probe::solid("Fragile", 50, &ledger);
    fragile.fail_on_frame = Some(3);
    let mut controller = controller_with(vec![Probe::solid("A", 10, &ledger), fragile])?;
    let transport = RecordingTransport::default();
    controller.start("Fragile", Box::new(transport.clone()))?;

    wait_until("fault", || controller.status().loop_state.starts_with("faulted"));
    assert!(controller.status().loop_state.contains("Fragile"));
    assert_eq!(controller.current_source(), Some("Fragile"));

    // A faulted source can be restarted by switching to it again.
    assert_eq!(controller.switch_source("Fragile")?, SwitchOutcome::Switched);
    assert_eq!(controller.status().loop_state, "running");
    wait_for_value(&transport, 50, 6);

    assert_eq!(controller.switch_source("A")?, SwitchOutcome::Switched);
    wait_for_value(&transport, 10, 3);
    controller.stop()?;

    assert_eq!(ledger.count("deactivate:Fragile"), 2);
    assert_eq!(ledger.count("activate:Fragile"), 2);
    Ok(())
}

#[test]
fn stop_joins_promptly_and_deactivates_once() -> Result<()> {
    let ledger = Ledger::default();
    let mut controller = controller_with(vec![Probe::solid("A", 10, &ledger)])?;
    let transport = RecordingTransport::default();
    controller.start("A", Box::new(transport.clone()))?;
    wait_for_value(&transport, 10, 3);

    let started = Instant::now();
    controller.stop()?;
    controller.stop()?;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(ledger.count("deactivate:A"), 1);
    assert_eq!(controller.current_source(), None);
    assert_eq!(controller.status().loop_state, "idle");

    let settled = transport.values().len();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.values().len(), settled);
    Ok(())
}

#[test]
fn published_order_matches_production_order() -> Result<()> {
    let ledger = Ledger::default();
    let mut counter = Probe::solid("Counter", 0, &ledger);
    counter.content = Content::Counter;
    let mut controller = controller_with(vec![counter])?;
    let transport = RecordingTransport::default();
    controller.start("Counter", Box::new(transport.clone()))?;
    wait_until("40 frames", || transport.values().len() >= 40);
    controller.stop()?;

    let values = transport.values();
    assert_eq!(&values[..2], &[BLANK, BLANK]);
    for (i, value) in values[2..].iter().enumerate() {
        assert_eq!(*value, (i % 255) as u8 + 1, "frame {} out of order", i);
    }
    let status = controller.status();
    assert_eq!(status.frames_dropped, 0);
    assert_eq!(status.frames_failed, 0);
    Ok(())
}

#[test]
fn unknown_default_source_fails_start() -> Result<()> {
    let ledger = Ledger::default();
    let mut controller = controller_with(vec![Probe::solid("A", 10, &ledger)])?;
    let err = controller
        .start("Nope", Box::new(RecordingTransport::default()))
        .unwrap_err();
    assert!(is_unknown_source(&err));
    assert!(ledger.calls().is_empty());
    Ok(())
}
