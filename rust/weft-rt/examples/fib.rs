//! Promise-driven Fibonacci.
//!
//! Each call publishes its result through a promise; the combining task
//! waits on both child promises without ever blocking a worker. Run with
//! the usual environment, e.g.:
//!
//! ```sh
//! WEFT_HPT_FILE=hpt.toml WEFT_STATS=1 cargo run --example fib -- 30
//! ```

use std::process::ExitCode;

use weft_rt::{finish, launch, spawn, spawn_await, Promise};

fn fib(n: u64, res: Promise<u64>) {
    if n <= 1 {
        res.put(n);
        return;
    }

    // Left child asynchronously, right child on this fiber.
    let f1 = Promise::new();
    let f2 = Promise::new();
    {
        let f1 = f1.clone();
        spawn(move || fib(n - 1, f1));
    }
    fib(n - 2, f2.clone());

    let deps = [f1.dep(), f2.dep()];
    spawn_await(&deps, move || {
        res.put(*f1.get() + *f2.get());
    });
}

fn main() -> ExitCode {
    env_logger::init();
    let n: u64 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(30);

    let result = Promise::new();
    let out = result.clone();
    match launch(move || finish(|| fib(n, out))) {
        Ok(stats) => {
            println!("fib({n}) = {}", result.get());
            log::info!("{stats}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("weft: {err}");
            ExitCode::FAILURE
        }
    }
}
