use std::collections::HashMap;
use std::time::{Duration, Instant};

use ulid::Ulid;

use allot::detector::find_conflicts;
use allot::model::{Allocation, Event, Ms, Resource, Span};

const HOUR: Ms = 3_600_000; // 1 hour in ms
const RUNS: usize = 20;

struct Schedule {
    events: HashMap<Ulid, Event>,
    resources: HashMap<Ulid, Resource>,
    allocations: Vec<Allocation>,
}

/// Small deterministic generator so runs are comparable.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// `events` meetings of 30 min to 3 h spread over `days`, each booked on one
/// of `resources` rooms.
fn build(resources: usize, events: usize, days: i64, seed: u64) -> Schedule {
    let mut rng = XorShift(seed);

    let rooms: Vec<Resource> = (0..resources)
        .map(|i| Resource {
            id: Ulid::new(),
            name: format!("Room {i}"),
            kind: "room".into(),
        })
        .collect();

    let mut event_map = HashMap::with_capacity(events);
    let mut allocations = Vec::with_capacity(events);
    let horizon = (days * 24) as u64;

    for i in 0..events {
        let start = rng.below(horizon) as Ms * HOUR;
        let len = (1 + rng.below(6)) as Ms * HOUR / 2;
        let event = Event {
            id: Ulid::new(),
            title: format!("Meeting {i}"),
            span: Span::new(start, start + len),
            description: None,
        };
        let room = &rooms[rng.below(resources as u64) as usize];
        allocations.push(Allocation {
            id: Ulid::new(),
            event_id: event.id,
            resource_id: room.id,
        });
        event_map.insert(event.id, event);
    }

    Schedule {
        events: event_map,
        resources: rooms.into_iter().map(|r| (r.id, r)).collect(),
        allocations,
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn run(label: &str, schedule: &Schedule) {
    let mut latencies = Vec::with_capacity(RUNS);
    let mut found = 0;
    for _ in 0..RUNS {
        let start = Instant::now();
        found = find_conflicts(&schedule.allocations, &schedule.events, &schedule.resources).len();
        latencies.push(start.elapsed());
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    allocations={}, conflicts={found}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, max={:.2}ms",
        schedule.allocations.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(&latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(&latencies, 95.0).as_secs_f64() * 1000.0,
        latencies.last().copied().unwrap_or_default().as_secs_f64() * 1000.0,
    );
}

fn main() {
    println!("overlap detector");
    run("sparse: 1k events, 50 rooms, 30 days", &build(50, 1_000, 30, 0x9E37_79B9));
    run("busy: 10k events, 100 rooms, 30 days", &build(100, 10_000, 30, 0x85EB_CA6B));
    run("crowded: 10k events, 5 rooms, 7 days", &build(5, 10_000, 7, 0xC2B2_AE35));
    run("large: 100k events, 1k rooms, 365 days", &build(1_000, 100_000, 365, 0x27D4_EB2F));
}
