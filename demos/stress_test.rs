//! Runs a program on top of `UnixAllocator` as the global allocator: boxes,
//! strings, and vectors that grow in place are created and dropped at
//! random, and the heap is checked along the way.

use seglist_allocator::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Total number of operations
const STEPS: usize = 64 * 1024;
// Objects kept alive at most
const MAX_LIVE: usize = 2048;
// Log_2 of the largest vector length
const LOG2_MAX_LEN: u32 = 14;

enum Object {
    Boxed(Box<[u64; 4]>),
    Text(String),
    Numbers(Vec<u32>),
}

impl Object {
    fn random<R: Rng>(rng: &mut R, log2_max_len: u32) -> Self {
        let len = 1usize << Uniform::new_inclusive(0, log2_max_len).sample(rng);
        let len = Uniform::new_inclusive(1, len).sample(rng);
        match rng.gen_range(0, 3) {
            0 => Object::Boxed(Box::new([len as u64; 4])),
            1 => Object::Text("x".repeat(len)),
            _ => Object::Numbers((0..len as u32).collect()),
        }
    }

    // Vectors and strings grow by pushing, which goes through realloc.
    fn grow<R: Rng>(&mut self, rng: &mut R) {
        let extra = rng.gen_range(1, 256);
        match self {
            Object::Boxed(_) => {}
            Object::Text(s) => s.extend(std::iter::repeat('y').take(extra)),
            Object::Numbers(v) => {
                let start = v.len() as u32;
                v.extend(start..start + extra as u32)
            }
        }
    }

    fn verify(&self) {
        match self {
            Object::Boxed(b) => assert!(b.iter().all(|&x| x == b[0])),
            Object::Text(s) => assert!(s.bytes().all(|c| c == b'x' || c == b'y')),
            Object::Numbers(v) => assert!(v.iter().enumerate().all(|(i, &x)| i as u32 == x)),
        }
    }
}

fn check(step: usize) {
    let (validity, stats) = match ALLOCATOR.stats() {
        Some(found) => found,
        None => panic!("allocator failed to initialize"),
    };
    if !validity.is_valid() {
        panic!("Heap invalid at step {}: {:?}", step, validity);
    }
    if step % 4096 == 0 {
        println!("Step {}: {:?}", step, stats);
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [STEPS] [MAX_LIVE] [LOG2_MAX_LEN]", args[0]);
        return;
    }
    let steps: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(STEPS);
    let max_live: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAX_LIVE)
        .max(1);
    let log2_max_len: u32 = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_LEN);

    // The allocator logs from inside the global allocator, where a logger
    // that allocates would deadlock it.
    env_logger::Builder::from_default_env()
        .filter_module("seglist_allocator", log::LevelFilter::Off)
        .init();

    println!("Running Stress Test.\n\nParameters:");
    println!("    {} steps", steps);
    println!("    {} live objects at most", max_live);
    println!("    2^{} max object length", log2_max_len);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut objects: Vec<Object> = Vec::new();
    for step in 1..=steps {
        let roll = rng.gen_range(0, 10);
        if objects.is_empty() || (roll < 5 && objects.len() < max_live) {
            objects.push(Object::random(&mut rng, log2_max_len));
        } else if roll < 8 {
            let ix = rng.gen_range(0, objects.len());
            objects[ix].grow(&mut rng);
        } else {
            let ix = rng.gen_range(0, objects.len());
            let obj = objects.swap_remove(ix);
            obj.verify();
        }
        check(step);
    }

    for obj in objects.drain(..) {
        obj.verify();
    }
    drop(objects);
    check(0);

    println!("\nFinished.");
}
