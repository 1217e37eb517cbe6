use std::{process, sync::Arc};

use postcache::{
    cache::{CacheConfig, KeyValueStore, Outcome, TenantId},
    config,
    host::{ListQuery, MemoryHost, QueryRun, Repository},
    infra::{error::InfraError, memory::MemoryStore, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "postcache error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "postcache error");
    });
}

fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Simulate(config::SimulateArgs::default()));

    telemetry::init(&settings.logging)?;
    let cache_config = settings.cache_config();

    match command {
        config::Command::Simulate(args) => run_simulate(cache_config, args),
        config::Command::Fingerprint(args) => run_fingerprint(cache_config, args),
    }
}

fn run_fingerprint(
    cache_config: CacheConfig,
    args: config::FingerprintArgs,
) -> Result<(), InfraError> {
    let fingerprinter = postcache::cache::Fingerprinter::new(cache_config.placeholder_markers);
    println!("{}", fingerprinter.fingerprint(&args.query));
    Ok(())
}

fn run_simulate(cache_config: CacheConfig, args: config::SimulateArgs) -> Result<(), InfraError> {
    if args.page_size == 0 {
        return Err(InfraError::configuration(
            "simulate requires a non-zero --page-size",
        ));
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(&cache_config));
    let repo = Arc::new(Repository::with_defaults(TenantId(args.tenant)));
    let host = MemoryHost::new(cache_config, store, repo);

    for n in 0..args.items {
        host.insert("post", &format!("Seed post {n}"));
    }

    let query = ListQuery::of_type("post").page_size(args.page_size);

    report("cold query", &host.query(&query));
    report("repeat query", &host.query(&query));

    let id = host.insert("post", "Fresh post");
    info!(target: "postcache::simulate", id, "Inserted one post");
    report("after insert", &host.query(&query));

    if let Some(latest) = host.query(&query).ids().first().copied() {
        host.save_preview(latest, "Unsaved draft");
        host.autosave(latest, "Autosaved draft");
        report("after preview and autosave", &host.query(&query));
    }

    host.insert("page", "About");
    report("after unrelated page insert", &host.query(&query));

    let other = TenantId(args.tenant.wrapping_add(1));
    host.switch_tenant(other);
    report("other tenant", &host.query(&query));

    info!(
        target: "postcache::simulate",
        executions = host.executions(),
        "Simulation finished"
    );
    Ok(())
}

fn report(step: &str, run: &QueryRun) {
    let outcome = match run.outcome {
        Outcome::Hit => "hit",
        Outcome::Miss => "miss",
        Outcome::Bypass => "bypass",
        Outcome::Pending => "pending",
    };
    info!(
        target: "postcache::simulate",
        step,
        outcome,
        executed = run.executed,
        rows = run.result.rows.len(),
        found = ?run.found(),
        max_pages = ?run.max_pages(),
        "Query finished"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;

    #[derive(Clone, Default)]
    struct Targets(Arc<Mutex<Vec<String>>>);

    impl<S: Subscriber> Layer<S> for Targets {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0
                .lock()
                .expect("targets lock")
                .push(event.metadata().target().to_string());
        }
    }

    #[test]
    fn simulation_steps_log_under_the_simulate_target() {
        let targets = Targets::default();
        let subscriber = tracing_subscriber::registry().with(targets.clone());

        tracing::subscriber::with_default(subscriber, || {
            run_simulate(CacheConfig::default(), config::SimulateArgs::default())
                .expect("simulation");
        });

        let targets = targets.0.lock().expect("targets lock");
        let simulate = targets
            .iter()
            .filter(|target| target.as_str() == "postcache::simulate")
            .count();
        // One per reported step, the insert and the final summary.
        assert!(simulate >= 8, "got {simulate} simulate events");
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let args = config::SimulateArgs {
            page_size: 0,
            ..Default::default()
        };
        let result = run_simulate(CacheConfig::default(), args);
        assert!(matches!(result, Err(InfraError::Configuration { .. })));
    }
}
