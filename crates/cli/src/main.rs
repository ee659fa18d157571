//! `presto <module.wasm>`: compile a WASI module to native code and run
//! its entry export.

use presto_runtime::Instance;
use std::time::Instant;
use std::{env, fs, process};
use tracing::debug;

fn main() {
    tracing_subscriber::fmt::init();

    let args = env::args().collect::<Vec<String>>();
    let args = args.iter().map(|v| v.as_str()).collect::<Vec<&str>>();
    let args = &args[..];

    let [bin_name, input] = args else {
        eprintln!("usage: {} <module.wasm>", args.first().copied().unwrap_or("presto"));
        process::exit(2);
    };
    let _ = bin_name;

    let bytes = match fs::read(input) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{input}: {err}");
            process::exit(1);
        }
    };

    let started = Instant::now();
    let module = match presto_module::decode_module(&bytes) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("{input}: {err}");
            process::exit(1);
        }
    };
    let instance = match Instance::new(module) {
        Ok(instance) => instance,
        Err(err) => {
            eprintln!("{input}: {err}");
            process::exit(1);
        }
    };
    debug!(elapsed = ?started.elapsed(), "compiled");

    let Some(entry) = instance.entry_export() else {
        eprintln!("{input}: no _start export and no unique exported function");
        process::exit(1);
    };
    let entry = entry.to_string();

    // A `proc_exit` inside the guest terminates the process directly with
    // the guest's code; reaching this point means a normal return.
    if let Err(err) = instance.invoke(&entry, &[]) {
        eprintln!("{input}: {err}");
        process::exit(1);
    }
}
