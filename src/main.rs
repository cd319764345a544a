//! Command line front end: explores one method of an RSN program and
//! prints how each path ended.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use symdex::class::ClassManager;
use symdex::config::{self, LoadError};
use symdex::instruction::MethodReference;
use symdex::node::{ExecutionGraph, ExecutionNode};
use symdex::vm::{Configuration, VirtualMachine};
use tracing_subscriber::filter::LevelFilter;

/// Explores one method of an RSN program symbolically.
#[derive(Parser, Debug)]
#[command(name = "symdex")]
#[command(author, version, about, long_about = None)]
struct Arguments {
    /// The RSN program to load
    program: PathBuf,

    /// The method to explore, such as `Lcom/example/Foo;->run(I)V`
    method: String,

    /// Execution limits to use instead of the default configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trace every executed instruction
    #[arg(short, long)]
    verbose: bool,
}

impl Arguments {
    fn configuration(&self) -> Result<Configuration, LoadError> {
        match &self.config {
            Some(path) => config::load_configuration(path),
            None => match config::default_configuration_path().filter(|path| path.exists()) {
                Some(path) => config::load_configuration(path),
                None => Ok(Configuration::default()),
            },
        }
    }
}

fn main() -> ExitCode {
    let args = Arguments::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            LevelFilter::TRACE
        } else {
            LevelFilter::WARN
        })
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(graph) => {
            print_summary(&graph);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Arguments) -> Result<ExecutionGraph, Box<dyn std::error::Error>> {
    let configuration = args.configuration()?;
    let program = config::load_program(&args.program)?;
    let method = args.method.parse::<MethodReference>()?;

    let vm = VirtualMachine::new(ClassManager::from_program(program))
        .with_configuration(configuration);
    let state = vm.initial_state(&method)?;
    Ok(vm.run(&method, state)?)
}

fn print_summary(graph: &ExecutionGraph) {
    println!("nodes: {}", graph.len());
    match graph.truncation() {
        Some(reason) => println!("truncated: {reason}"),
        None => println!("complete"),
    }
    for (_, node) in graph.terminals() {
        println!("{}", outcome(node));
    }
}

fn outcome(node: &ExecutionNode) -> String {
    let location = format!("{} @{}", node.method().reference(), node.address());
    if let Some(error) = node.error() {
        format!("{location}: failed: {error}")
    } else if let Some(exception) = node.exception() {
        format!("{location}: threw {exception}")
    } else if node.method().reference().return_type.is_void() {
        format!("{location}: returned")
    } else {
        match node.state().result_register() {
            Some(value) => format!("{location}: returned {value}"),
            None => format!("{location}: returned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_are_consistent() {
        Arguments::command().debug_assert();
    }

    #[test]
    fn parses_positionals_and_flags() {
        let args = Arguments::try_parse_from([
            "symdex",
            "program.rsn",
            "Lt;->run()V",
            "--config",
            "limits.rsn",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.program, PathBuf::from("program.rsn"));
        assert_eq!(args.method, "Lt;->run()V");
        assert_eq!(args.config, Some(PathBuf::from("limits.rsn")));
        assert!(args.verbose);
    }

    #[test]
    fn method_is_required() {
        assert!(Arguments::try_parse_from(["symdex", "program.rsn"]).is_err());
    }
}
