//! `runtrack check`: would this process be tracked?

use std::path::PathBuf;

use runtrack_core::gate::{Gate, HostFacts, ReentrancyCounter};
use runtrack_core::recorder::is_executable;
use runtrack_core::{BuildVariant, Collaborators, Config, MemEnv, RunKind, Settings};
use serde::Serialize;

#[derive(Serialize)]
struct CheckReport {
    variant: &'static str,
    exec: String,
    nodename: Option<String>,
    admitted: bool,
    reject: Option<&'static str>,
    reason: Option<String>,
    kind: Option<RunKind>,
    rank: Option<i64>,
    size: Option<i64>,
    tracks: String,
    recorder: String,
    recorder_available: bool,
}

/// Run the check command.
pub fn run(exec: Option<&str>, variant: BuildVariant, json: bool) {
    let mut env = MemEnv::snapshot();
    let config = Config::for_variant(variant);
    let settings = Settings::read(&env, &config);
    let collab = Collaborators::default();

    let mut facts = HostFacts::detect(None);
    if let Some(exec) = exec {
        facts.exec_path = PathBuf::from(exec);
    }

    let gate = Gate {
        config: &config,
        settings: &settings,
        collab: &collab,
    };
    let outcome = gate.evaluate(&mut env, &mut ReentrancyCounter::default(), &facts);

    let report = CheckReport {
        variant: variant.token(),
        exec: facts.exec_path.display().to_string(),
        nodename: facts.nodename.clone(),
        admitted: outcome.is_ok(),
        reject: outcome.as_ref().err().map(|r| r.label()),
        reason: outcome.as_ref().err().map(ToString::to_string),
        kind: outcome.as_ref().ok().map(|a| a.kind),
        rank: outcome.as_ref().ok().map(|a| a.scale.rank),
        size: outcome.as_ref().ok().map(|a| a.scale.size),
        tracks: settings.support.to_string(),
        recorder: config.recorder.display().to_string(),
        recorder_available: is_executable(&config.recorder),
    };

    if json {
        super::print_json(&report);
        return;
    }

    println!("variant:   {}", report.variant);
    println!("exec:      {}", report.exec);
    println!("nodename:  {}", report.nodename.as_deref().unwrap_or("(uname failed)"));
    println!("tracks:    {}", report.tracks);
    println!(
        "recorder:  {} ({})",
        report.recorder,
        if report.recorder_available { "executable" } else { "missing" }
    );
    match outcome {
        Ok(a) => println!(
            "decision:  tracked as {} (rank {}, {} task{})",
            a.kind,
            a.scale.rank,
            a.scale.size,
            if a.scale.size == 1 { "" } else { "s" }
        ),
        Err(r) => println!("decision:  not tracked: {} ({r})", r.label()),
    }
}
