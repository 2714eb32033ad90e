use clap::Parser;
use color_eyre::Result;
use coproof_core::ExecutionOutcome;

mod cli;
mod dispatch;
mod output;
mod style;

use cli::CoproofCli;
use dispatch::{dispatch_command, CommandContext, CommandInfo};
use output::{emit_output, OutputOptions};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = CoproofCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let opts = OutputOptions {
        quiet: cli.quiet,
        json: cli.json,
        no_color: cli.no_color,
    };
    let (info, outcome) = match CommandContext::new(cli.storage.as_deref()) {
        Ok(ctx) => dispatch_command(&ctx, &cli.command),
        Err(err) => (
            CommandInfo::new("config"),
            ExecutionOutcome::from_error(&err),
        ),
    };
    let code = emit_output(&opts, info, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("coproof_core={level},coproof_domain={level},coproof_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
