use std::time::Instant;
use thunkmem::{Os, OwnerToken, ThunkAllocator, ThunkRequest};

static THUNKS: ThunkAllocator = ThunkAllocator::new(Os);

/// Machine code for `extern "C" fn() -> i32 { value }`, if the host is supported.
fn return_const(value: u16) -> Option<Vec<u8>> {
    if cfg!(target_arch = "x86_64") {
        let mut code = vec![0xB8];
        code.extend_from_slice(&u32::from(value).to_le_bytes());
        code.push(0xC3);
        Some(code)
    } else if cfg!(target_arch = "aarch64") {
        let movz = 0x5280_0000u32 | (u32::from(value) << 5);
        Some([movz, 0xD65F_03C0].iter().flat_map(|i| i.to_le_bytes()).collect())
    } else {
        None
    }
}

fn main() {
    println!("thunkmem demo");
    println!("=============\n");

    let owner = OwnerToken::new(0xD3_0000);
    let Some(code) = return_const(42) else {
        println!("no code generator for this architecture");
        return;
    };

    let thunk = match THUNKS.allocate(ThunkRequest::new(code.len(), owner)) {
        Ok(thunk) => thunk,
        Err(e) => {
            println!("allocate failed: {e}");
            return;
        }
    };
    if let Some((base, size)) = THUNKS.region_bounds() {
        println!("region:      base = {base:p}, size = {size}");
    }
    println!(
        "thunk:       {:p}, usable = {:?}",
        thunk,
        THUNKS.usable_size(thunk)
    );

    {
        let _w = THUNKS.write_window();
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), thunk.as_ptr(), code.len()) };
    }
    unsafe { THUNKS.finalize(thunk.as_ptr(), code.len()) };

    let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(thunk.as_ptr()) };
    println!("call:        {}", f());
    println!("owner:       {:?}", THUNKS.lookup(thunk));
    println!("release:     {:?}", THUNKS.release(thunk));

    // Churn
    println!("\nchurn (10k allocate/release pairs):");
    let start = Instant::now();
    for i in 0..10_000usize {
        let size = 16 + (i % 8) * 16;
        if let Ok(t) = THUNKS.allocate(ThunkRequest::new(size, owner)) {
            THUNKS.release(t);
        }
    }
    println!("  elapsed = {:?}", start.elapsed());
    println!("  free bytes = {:?}", THUNKS.free_bytes());

    for _ in 0..5 {
        let _ = THUNKS.allocate(ThunkRequest::new(64, owner));
    }
    println!("\nrelease_owner: {}", THUNKS.release_owner(owner));
    println!("teardown:      {} live", THUNKS.teardown());
}
