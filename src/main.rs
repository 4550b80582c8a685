use tracing::Level;

use burrow::arglex;
use burrow::conf::FeatureConf;
use burrow::driver;
use burrow::error::Error;
use burrow::identity::{self, IdentityGate};
use burrow::policy::PolicyBuilder;
use burrow::profile;
use burrow::registry::RunRegistry;
use burrow::shortcut::Shortcuts;

fn report(e: Error) -> i32 {
    eprintln!("Error: {}", e);
    1
}

// --quiet/--debug matter before the parse proper, for the log setup
fn arg_present(argv: &[String], flag: &str) -> bool {
    for arg in &argv[1..] {
        if arg == flag {
            return true;
        }
        if arg == "--" || !arg.starts_with('-') {
            break;
        }
    }
    false
}

fn run(argv: Vec<String>) -> i32 {
    // drop privileges right away; they come back only through the gate
    let gate = match IdentityGate::init() {
        Ok(gate) => gate,
        Err(e) => return report(e),
    };

    let quiet = arg_present(&argv, "--quiet");
    let debug = !quiet && arg_present(&argv, "--debug");
    let level = if debug {
        Level::TRACE
    } else if quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let conf = match FeatureConf::load() {
        Ok(conf) => conf,
        Err(e) => return report(e),
    };

    let identity = match identity::resolve(&gate) {
        Ok(identity) => identity,
        Err(e) => return report(e),
    };
    if let Err(e) = identity::check_allowed(&identity.username, identity.uid) {
        return report(e);
    }

    let sandbox_pid = std::process::id() as i32;
    let registry = RunRegistry::system();
    // fresh tree, dead siblings swept, stale leftovers for our pid gone
    let prep = gate.as_root(|root| {
        registry.build(root)?;
        registry.sweep_dead(root)?;
        registry.delete(root, sandbox_pid)
    });
    if let Err(e) = prep {
        return report(e);
    }
    gate.assert_user();

    let lexed = match arglex::lex(&argv) {
        Ok(lexed) => lexed,
        Err(e) => return report(e),
    };

    let mut builder = PolicyBuilder::new(&conf, identity.clone(), sandbox_pid);
    let shortcuts = Shortcuts {
        gate: &gate,
        conf: &conf,
        registry: &registry,
        identity: &identity,
    };

    for item in &lexed.items {
        // query-and-exit options short-circuit the build pipeline
        match shortcuts.dispatch(item, &argv, &builder) {
            Ok(Some(code)) => return code,
            Ok(None) => {}
            Err(e) => return report(e),
        }
        if let Err(e) = builder.apply_cli(item) {
            return report(e);
        }
    }
    let program_argv = lexed.program_start.map(|i| argv[i..].to_vec());

    let command_name = match builder.resolve_command_name(program_argv.as_deref()) {
        Ok(name) => name,
        Err(e) => return report(e),
    };
    if let Err(e) = profile::autoload(&mut builder, &command_name) {
        return report(e);
    }

    let policy = match builder.finish(program_argv) {
        Ok(policy) => policy,
        Err(e) => return report(e),
    };

    let outcome = driver::run(&gate, &registry, &policy);

    // the record always goes away with the parent
    let _ = gate.as_root(|root| registry.delete(root, policy.sandbox_pid));

    match outcome {
        Ok(code) => {
            if !policy.quiet && !policy.command_mode {
                println!("\nParent is shutting down, bye...");
            }
            code
        }
        Err(e) => report(e),
    }
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    std::process::exit(run(argv));
}
