/*
 * raftsim is the interactive simulator shell. It optionally loads a scenario
 * file, then accepts commands to step the simulation, inject faults, install
 * network rules, and inspect cluster state. With --play it instead runs the
 * scenario to completion, prints the assertion report, and exits non-zero if
 * any assertion failed.
 */

#![warn(clippy::all)]

use raftsim::errinput;
use raftsim::error::Result;
use raftsim::scenario;
use raftsim::sim::{Action, NodeId, Rule};
use raftsim::{Controller, RaftModel, Scenario, WriteOutcome};

use rustyline::error::ReadlineError;
use std::collections::HashMap;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("Deterministic discrete-event simulator for Raft consensus")
        .arg(clap::Arg::new("scenario").help("Scenario file to load on startup"))
        .arg(
            clap::Arg::new("play")
                .long("play")
                .action(clap::ArgAction::SetTrue)
                .help("Run the loaded scenario to completion and exit"),
        )
        .arg(
            clap::Arg::new("log_level")
                .long("log-level")
                .default_value("info")
                .help("Log level (off, error, warn, info, debug, trace)"),
        )
        .get_matches();

    let loglevel = args.get_one::<String>("log_level").unwrap().parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("raftsim");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let scenario =
        args.get_one::<String>("scenario").map(|path| Scenario::load(path)).transpose()?;

    if args.get_flag("play") {
        let Some(scenario) = scenario else {
            return errinput!("--play requires a scenario file");
        };
        let mut controller = Controller::from_scenario(&scenario)?;
        let outcomes = controller.play()?;
        let mut failed = false;
        for outcome in &outcomes {
            println!("{outcome}");
            failed = failed || !outcome.passed;
        }
        if failed {
            std::process::exit(1);
        }
        return Ok(());
    }

    Repl::new(scenario)?.run()
}

/// The interactive shell. Commands operate on a controller built by `init`
/// or `load`; the model surface and the bus rule API are the only points of
/// contact with the simulation.
struct Repl {
    controller: Option<Controller>,
    editor: rustyline::DefaultEditor,
}

impl Repl {
    /// Creates the shell, with a controller if a scenario was given.
    fn new(scenario: Option<Scenario>) -> Result<Self> {
        let controller =
            scenario.as_ref().map(Controller::from_scenario).transpose()?;
        Ok(Self { controller, editor: rustyline::DefaultEditor::new()? })
    }

    /// Runs the shell until quit or EOF.
    fn run(&mut self) -> Result<()> {
        println!("raftsim: deterministic Raft simulator. Type 'help' for commands.");
        while let Some(input) = self.prompt()? {
            if input.is_empty() {
                continue;
            }
            match self.command(&input) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => println!("{err}"),
            }
        }
        Ok(())
    }

    /// Reads a line, returning None on EOF or interrupt.
    fn prompt(&mut self) -> Result<Option<String>> {
        match self.editor.readline("raftsim> ") {
            Ok(input) => {
                let _ = self.editor.add_history_entry(&input);
                Ok(Some(input.trim().to_string()))
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Dispatches a command. Returns false to exit the loop.
    fn command(&mut self, input: &str) -> Result<bool> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        match parts.as_slice() {
            ["load", path] => self.load(path)?,
            ["load"] => return errinput!("usage: load <path>"),
            ["init", rest @ ..] => self.init(rest)?,
            ["step", rest @ ..] => self.step(rest)?,
            ["run", rest @ ..] => self.run_ticks(rest)?,
            ["play"] => self.play()?,
            ["write", ..] => self.write(input)?,
            ["crash", id] => {
                self.controller()?.model_mut().crash(&id.to_string())?;
                println!("Crashed {id}");
            }
            ["recover", id] => {
                self.controller()?.model_mut().recover(&id.to_string())?;
                println!("Recovered {id}");
            }
            ["crash"] => return errinput!("usage: crash <id>"),
            ["recover"] => return errinput!("usage: recover <id>"),
            ["partition", rest @ ..] => self.partition(rest)?,
            ["delay", rest @ ..] => self.delay_rule(rest)?,
            ["drop", rest @ ..] => self.drop_rule(rest)?,
            ["dump", rest @ ..] => self.dump(rest)?,
            ["help"] => Self::help(),
            ["quit"] | ["exit"] => return Ok(false),
            [command, ..] => return errinput!("unknown command {command}, try 'help'"),
            [] => {}
        }
        Ok(true)
    }

    /// Returns the controller, or errors if none was initialized.
    fn controller(&mut self) -> Result<&mut Controller> {
        match &mut self.controller {
            Some(controller) => Ok(controller),
            None => errinput!("no model loaded, use 'init' or 'load' first"),
        }
    }

    /// load <path>: replaces the controller with one built from a scenario.
    fn load(&mut self, path: &str) -> Result<()> {
        let scenario = Scenario::load(path)?;
        self.controller = Some(Controller::from_scenario(&scenario)?);
        println!(
            "Loaded scenario from {path}: {} nodes, {} timeline actions, {} assertions",
            scenario.cluster.nodes.len(),
            scenario.timeline.len(),
            scenario.assertions.len(),
        );
        Ok(())
    }

    /// init raft --nodes N --seed S: builds a fresh model.
    fn init(&mut self, args: &[&str]) -> Result<()> {
        if args.first() != Some(&"raft") {
            return errinput!("usage: init raft --nodes N --seed S");
        }
        let mut nodes: usize = 3;
        let mut seed = scenario::default_seed();
        let mut iter = args[1..].iter();
        while let Some(flag) = iter.next() {
            let value = iter.next().ok_or_else(|| {
                raftsim::Error::InvalidInput(format!("flag {flag} requires a value"))
            })?;
            match *flag {
                "--nodes" => nodes = value.parse()?,
                "--seed" => seed = value.parse()?,
                other => return errinput!("unknown flag {other}"),
            }
        }
        if nodes == 0 {
            return errinput!("cluster requires at least one node");
        }
        let ids: Vec<NodeId> = (1..=nodes).map(|i| format!("n{i}")).collect();
        self.controller = Some(Controller::new(RaftModel::new(&ids, seed)?));
        println!("Initialized Raft cluster with {nodes} nodes, seed={seed}");
        Ok(())
    }

    /// step [N]: advances the simulation.
    fn step(&mut self, args: &[&str]) -> Result<()> {
        let n = match args {
            [] => 1,
            [n] => n.parse()?,
            _ => return errinput!("usage: step [N]"),
        };
        let controller = self.controller()?;
        controller.step_n(n)?;
        println!("Advanced {n} ticks to t={}", controller.now());
        Ok(())
    }

    /// run [N]: advances the simulation, reporting progress every 5 ticks.
    fn run_ticks(&mut self, args: &[&str]) -> Result<()> {
        let n = match args {
            [] => 10,
            [n] => n.parse()?,
            _ => return errinput!("usage: run [N]"),
        };
        let controller = self.controller()?;
        println!("Running simulation for {n} ticks...");
        for i in 0..n {
            controller.step()?;
            if i % 5 == 0 {
                println!("  step {}: t={}", i + 1, controller.now());
            }
        }
        println!("Run complete at t={}", controller.now());
        Ok(())
    }

    /// play: runs the scenario to its end and reports assertions.
    fn play(&mut self) -> Result<()> {
        let outcomes = self.controller()?.play()?;
        if outcomes.is_empty() {
            println!("Timeline complete at t={}, no assertions", self.controller()?.now());
        }
        for outcome in outcomes {
            println!("{outcome}");
        }
        Ok(())
    }

    /// write "<cmd>": submits a client write.
    fn write(&mut self, input: &str) -> Result<()> {
        let command = input
            .strip_prefix("write")
            .expect("write command must start with write")
            .trim()
            .trim_matches('"');
        if command.is_empty() {
            return errinput!("usage: write \"<command>\"");
        }
        match self.controller()?.model_mut().client_write(command)? {
            WriteOutcome::Accepted => println!("Write accepted by leader"),
            WriteOutcome::Queued => println!("No leader, write queued"),
        }
        Ok(())
    }

    /// partition add <A> <B> | partition clear. Groups are comma-separated
    /// node lists.
    fn partition(&mut self, args: &[&str]) -> Result<()> {
        match args {
            ["add", a, b] => {
                let group_a: Vec<NodeId> = a.split(',').map(String::from).collect();
                let group_b: Vec<NodeId> = b.split(',').map(String::from).collect();
                self.controller()?.model_mut().partition(&group_a, &group_b);
                println!("Partitioned {a} from {b}");
            }
            ["clear"] => {
                self.controller()?.model_mut().clear_partitions();
                println!("Cleared all network rules");
            }
            _ => return errinput!("usage: partition add <A> <B> | partition clear"),
        }
        Ok(())
    }

    /// delay from=A to=B [type=T] steps=k: installs a delay rule.
    fn delay_rule(&mut self, args: &[&str]) -> Result<()> {
        let kv = parse_kv(args);
        let (Some(from), Some(to), Some(steps)) = (kv.get("from"), kv.get("to"), kv.get("steps"))
        else {
            return errinput!("usage: delay from=<A> to=<B> [type=<T>] steps=<k>");
        };
        let rule = Rule {
            from: pattern(from),
            to: pattern(to),
            kind: kv.get("type").and_then(|t| pattern(t)),
            bidirectional: false,
            action: Action::Delay(steps.parse()?),
        };
        println!("Added rule {rule}");
        self.controller()?.model_mut().add_rule(rule);
        Ok(())
    }

    /// drop from=A to=B [type=T] [pct=p]: installs a drop rule. A pct below
    /// 1 makes the drop probabilistic, with fall-through on a miss.
    fn drop_rule(&mut self, args: &[&str]) -> Result<()> {
        let kv = parse_kv(args);
        let (Some(from), Some(to)) = (kv.get("from"), kv.get("to")) else {
            return errinput!("usage: drop from=<A> to=<B> [type=<T>] [pct=<p>]");
        };
        let pct: f64 = match kv.get("pct") {
            Some(pct) => pct.parse()?,
            None => 1.0,
        };
        if !(0.0..=1.0).contains(&pct) {
            return errinput!("drop probability {pct} must be in [0,1]");
        }
        let rule = Rule {
            from: pattern(from),
            to: pattern(to),
            kind: kv.get("type").and_then(|t| pattern(t)),
            bidirectional: false,
            action: if pct < 1.0 { Action::DropProb(pct) } else { Action::Drop },
        };
        println!("Added rule {rule}");
        self.controller()?.model_mut().add_rule(rule);
        Ok(())
    }

    /// dump [nodes|logs|net|state]: prints cluster state.
    fn dump(&mut self, args: &[&str]) -> Result<()> {
        let model = self.controller()?.model();
        match args {
            [] | ["state"] => print!("{}", model.dump()),
            ["nodes"] => print!("{}", model.dump_nodes()),
            ["logs"] => print!("{}", model.dump_logs()),
            ["net"] => print!("{}", model.dump_net()),
            _ => return errinput!("usage: dump [nodes|logs|net|state]"),
        }
        Ok(())
    }

    fn help() {
        println!("Commands:");
        println!("  load <path>                       load a scenario file");
        println!("  init raft --nodes N --seed S      build a fresh cluster");
        println!("  step [N]                          advance N ticks (default 1)");
        println!("  run [N]                           advance N ticks (default 10)");
        println!("  play                              run timeline and assertions");
        println!("  write \"<cmd>\"                     submit a client write");
        println!("  crash <id> / recover <id>         fault injection");
        println!("  partition add <A> <B>             drop traffic between groups");
        println!("  partition clear                   remove all network rules");
        println!("  delay from=A to=B [type=T] steps=k   install a delay rule");
        println!("  drop from=A to=B [type=T] [pct=p]    install a drop rule");
        println!("  dump [nodes|logs|net|state]       inspect the cluster");
        println!("  quit                              exit");
    }
}

/// Parses key=value arguments into a map.
fn parse_kv(args: &[&str]) -> HashMap<String, String> {
    args.iter()
        .filter_map(|arg| arg.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Normalizes a pattern argument: "*" is a wildcard.
fn pattern(value: &str) -> Option<String> {
    if value == "*" {
        None
    } else {
        Some(value.to_string())
    }
}
