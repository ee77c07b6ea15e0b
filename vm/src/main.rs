use clap::Parser;

use bytecode::{make_proto, CodeBuilder, FnClass};
use object::{T_INT, T_MIXED};
use vm::{ControlBuilder, Host, Value, KF_ADD, KF_SUB};

/// Run a sample program against the runtime core: an iterative sum,
/// optionally under a tick budget.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sum the integers 1..=N
    #[arg(default_value_t = 100)]
    n: i32,

    /// Tick budget for the computation (0 means unlimited)
    #[arg(long, default_value_t = 0)]
    ticks: i32,

    /// Enable strict typechecking
    #[arg(long)]
    strict: bool,
}

fn build_summer(limit: i32, ticks: i32) -> ControlBuilder {
    let mut cb = ControlBuilder::new();

    // sum(n): total = 0; while (n) { total += n; --n; } return total
    let mut c = CodeBuilder::new();
    let top = c.label();
    let out = c.label();
    c.push_int(0);
    c.store_local(-1, true);
    c.bind(top);
    c.push_local(0);
    c.jump_zero(out);
    c.push_local(-1);
    c.push_local(0);
    c.call_ckfun(KF_ADD, 2, false);
    c.store_local(-1, true);
    c.push_local(0);
    c.push_int(1);
    c.call_ckfun(KF_SUB, 2, false);
    c.store_local(0, true);
    c.jump(top);
    c.bind(out);
    c.push_local(-1);
    c.ret();
    cb.function(
        b"sum",
        FnClass::empty(),
        c.finish(&make_proto(FnClass::empty(), 1, 0, T_INT, &[T_INT]), 8, 1),
    );

    // run(): sum(limit), optionally under rlimits
    let mut c = CodeBuilder::new();
    if ticks > 0 {
        c.push_int(-1);
        c.push_int(ticks);
        c.rlimits(true);
        c.push_int(limit);
        c.call_afun(0, 1, false);
        c.ret();
        c.ret();
    } else {
        c.push_int(limit);
        c.call_afun(0, 1, false);
        c.ret();
    }
    cb.function(
        b"run",
        FnClass::empty(),
        c.finish(&make_proto(FnClass::empty(), 0, 0, T_MIXED, &[]), 8, 0),
    );

    cb
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    heap::minit(65536, 262144);
    let mut host = Host::new("create", cli.strict);
    let oi = host.load_object("summer", build_summer(cli.n, cli.ticks));

    match host.call(oi, "run", &[]) {
        Ok(Some(Value::Int(n))) => println!("sum(1..={}) = {}", cli.n, n),
        Ok(other) => println!("unexpected result: {other:?}"),
        Err(e) => {
            eprintln!("runtime error: {e}");
            std::process::exit(1);
        }
    }

    println!(
        "memory: {} bytes from the system, {} in use",
        heap::mem_size(),
        heap::mem_used()
    );
}
