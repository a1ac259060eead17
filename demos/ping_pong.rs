use fibers::{FiberId, FiberSpace};
use std::ffi::c_void;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

const ROUNDS: u64 = 3;

static SPACE: OnceLock<FiberSpace> = OnceLock::new();
static MAIN: AtomicU64 = AtomicU64::new(0);
static PONG: AtomicU64 = AtomicU64::new(0);
static COUNTER_SLOT: AtomicU64 = AtomicU64::new(0);

fn space() -> &'static FiberSpace {
    SPACE.get_or_init(FiberSpace::new)
}

fn bump_counter() -> u64 {
    let slot = COUNTER_SLOT.load(Ordering::SeqCst) as i64;
    let value = space().fls_get(slot).unwrap() + 1;
    space().fls_set(slot, value).unwrap();
    value
}

extern "C" fn ping(_: *mut c_void) {
    loop {
        println!("ping: start (counter = {})", bump_counter());
        space()
            .switch_to(FiberId(PONG.load(Ordering::SeqCst)))
            .unwrap();
        println!("ping: end");
        space()
            .switch_to(FiberId(MAIN.load(Ordering::SeqCst)))
            .unwrap();
    }
}

extern "C" fn pong(ping_id: *mut c_void) {
    let ping_id = FiberId(ping_id as u64);
    loop {
        println!("pong: start (counter = {})", bump_counter());
        space().switch_to(ping_id).unwrap();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let space = space();
    let main_id = space.convert_current().unwrap();
    MAIN.store(main_id.as_u64(), Ordering::SeqCst);

    let slot = space.fls_alloc().unwrap();
    space.fls_set(slot as i64, 0).unwrap();
    COUNTER_SLOT.store(slot as u64, Ordering::SeqCst);

    let ping_id = space
        .create_with_stack(space.alloc_stack(), ping, std::ptr::null_mut())
        .unwrap();
    let pong_id = space
        .create_with_stack(space.alloc_stack(), pong, ping_id.as_u64() as *mut c_void)
        .unwrap();
    PONG.store(pong_id.as_u64(), Ordering::SeqCst);

    for round in 1..=ROUNDS {
        println!("main: round {round}");
        space.switch_to(ping_id).unwrap();
    }

    println!(
        "All rounds completed! counter = {}",
        space.fls_get(slot as i64).unwrap()
    );
    for stats in space.all_stats() {
        println!("--- fiber {} ---\n{}", stats.id, stats);
    }
}
