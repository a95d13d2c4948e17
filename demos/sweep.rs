//! A parameter sweep with a summary task reading the whole family.
//!
//! Run it twice: the second run finds everything cached. Pass `--rerun` to
//! force the simulations again, the summary follows through cascading.

use std::process::ExitCode;
use std::time::Duration;

use stratum::{Params, Record, RunPolicy, Scheduler, Settings, Step, Value, producer};

fn simulate(decay: f64, steps: u64) -> impl Iterator<Item = anyhow::Result<Record>> {
    (0..steps).scan(1.0_f64, move |x, step| {
        *x *= 1.0 - decay;
        std::thread::sleep(Duration::from_millis(5));
        Some(Ok(Record::from([
            ("step".to_string(), Value::from(step)),
            ("x".to_string(), Value::from(*x)),
        ])))
    })
}

fn main() -> anyhow::Result<ExitCode> {
    #[cfg(feature = "logging")]
    stratum::logging::init()?;

    let settings = if std::fs::exists("stratum.toml")? {
        Settings::from_toml_file("stratum.toml")?
    } else {
        Settings::new(".stratum")
    };
    let mut scheduler = Scheduler::new(settings);

    scheduler.task("sim").describe("exponential decay").sweep(
        |ctx| {
            let decay = ctx.params().float("decay").unwrap_or(0.1);
            Ok(producer::records(simulate(decay, 200)))
        },
        [0.01, 0.05, 0.1, 0.2].map(|decay| Params::new().with("decay", decay)),
    )?;

    scheduler.task("summary").reads("sim").run(|ctx| {
        let sims = ctx.load("sim")?;
        let mut rows = Vec::new();

        for record in sims.records() {
            let last = record.column("x").last().cloned().unwrap_or(Value::Null);
            rows.push(Record::from([
                ("decay".to_string(), record.params().get("decay").cloned().unwrap_or(Value::Null)),
                ("final".to_string(), last),
            ]));
        }

        let mut rows = rows.into_iter();
        Ok(producer::from_fn(move || Ok(rows.next().map_or(Step::Done, Step::Record))))
    })?;

    let policy = if std::env::args().any(|arg| arg == "--rerun") {
        RunPolicy::rerun(["sim"])
    } else {
        RunPolicy::default()
    };

    println!("{}", scheduler.plan(&policy)?);

    let result = scheduler.run(&policy)?;
    print!("{}", result.report());
    result.diagnostics.render_waterfall_to_file("waterfall.svg")?;

    Ok(result.exit_code())
}
