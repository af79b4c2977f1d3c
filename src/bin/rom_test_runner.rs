use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use famicore::nes::{Nes, blargg};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Debug, Clone)]
struct SuiteTest {
    filename: String,
    system: String,
    runframes: u32,
    tvsha1: String,
    recordedinput: String,
}

#[derive(Debug, Clone)]
struct Config {
    roms: Vec<PathBuf>,
    dir: Option<PathBuf>,
    suite: Option<PathBuf>,
    rom_root: PathBuf,
    max_tests: usize,
    contains: Vec<String>,
    max_instructions: u64,
    json: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roms: Vec::new(),
            dir: None,
            suite: None,
            rom_root: PathBuf::from("tests/roms"),
            max_tests: 200,
            contains: Vec::new(),
            max_instructions: 200_000_000,
            json: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Verdict {
    Pass,
    Fail,
    Timeout,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
struct RunRecord {
    rom: String,
    verdict: Verdict,
    code: Option<u8>,
    message: String,
    instructions: u64,
    cycles: u64,
    frames: u64,
    unofficial_opcodes: u64,
    frame_sha1: Option<String>,
}

#[derive(Debug, Serialize)]
struct Report {
    passed: usize,
    failed: usize,
    timed_out: usize,
    skipped: usize,
    runtime_secs: f32,
    runs: Vec<RunRecord>,
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom tests/roms/01-basics.nes")?;
                cfg.roms.push(PathBuf::from(value));
            }
            "--dir" => {
                let value = args.next().context(
                    "--dir requires a path, e.g. --dir tests/roms/instr_test-v5/rom_singles",
                )?;
                cfg.dir = Some(PathBuf::from(value));
            }
            "--suite" => {
                let value = args
                    .next()
                    .context("--suite requires a path, e.g. --suite tests/roms/test_roms.xml")?;
                cfg.suite = Some(PathBuf::from(value));
            }
            "--rom-root" => {
                let value = args
                    .next()
                    .context("--rom-root requires a path, e.g. --rom-root tests/roms")?;
                cfg.rom_root = PathBuf::from(value);
            }
            "--max-tests" => {
                let value = args
                    .next()
                    .context("--max-tests requires an integer, e.g. --max-tests 120")?;
                cfg.max_tests = value
                    .parse::<usize>()
                    .with_context(|| format!("invalid --max-tests value: {value}"))?;
            }
            "--contains" => {
                let value = args
                    .next()
                    .context("--contains requires a substring, e.g. --contains branches")?;
                cfg.contains.push(value.to_lowercase());
            }
            "--max-instructions" => {
                let value = args.next().context(
                    "--max-instructions requires an integer, e.g. --max-instructions 50000000",
                )?;
                cfg.max_instructions = value
                    .parse::<u64>()
                    .with_context(|| format!("invalid --max-instructions value: {value}"))?;
            }
            "--json" => {
                let value = args
                    .next()
                    .context("--json requires a path, e.g. --json report.json")?;
                cfg.json = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    if cfg.roms.is_empty() && cfg.dir.is_none() && cfg.suite.is_none() {
        anyhow::bail!("nothing to run: pass --rom, --dir or --suite (see --help)");
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "ROM test runner for Famicore\n\n\
Usage:\n\
  cargo run --bin rom_test_runner -- [options]\n\n\
Self-checking ROMs (result byte at $6000):\n\
  --rom <path>                   Run one ROM (repeatable)\n\
  --dir <path>                   Run every .nes file in a directory\n\
  --max-instructions <n>         Per-ROM instruction limit (default 200000000)\n\n\
Screenshot suites:\n\
  --suite <path>                 Path to test_roms.xml\n\
  --rom-root <path>              Root path containing suite ROM files (default tests/roms)\n\n\
Common:\n\
  --max-tests <n>                Maximum number of tests to run (default 200)\n\
  --contains <substr>            Only run tests whose filename contains this text (repeatable)\n\
  --json <path>                  Write a machine-readable report\n\
  -h, --help                     Show this help\n"
    );
}

fn parse_suite_xml(path: &Path) -> Result<Vec<SuiteTest>> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read suite XML: {}", path.display()))?;

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<SuiteTest> = None;
    let mut reading_tvsha1 = false;
    let mut reading_recorded = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"test" => {
                    let mut test = SuiteTest {
                        filename: String::new(),
                        system: String::new(),
                        runframes: 0,
                        tvsha1: String::new(),
                        recordedinput: String::new(),
                    };
                    for attr in e.attributes().flatten() {
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        match attr.key.as_ref() {
                            b"filename" => test.filename = value,
                            b"system" => test.system = value,
                            b"runframes" => test.runframes = value.parse::<u32>().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current = Some(test);
                }
                b"tvsha1" => reading_tvsha1 = true,
                b"recordedinput" => reading_recorded = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.decode().map(|v| v.to_string()).unwrap_or_default();
                append_text(current.as_mut(), reading_tvsha1, reading_recorded, &text);
            }
            Ok(Event::CData(e)) => {
                let text = e.decode().map(|v| v.to_string()).unwrap_or_default();
                append_text(current.as_mut(), reading_tvsha1, reading_recorded, &text);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"tvsha1" => reading_tvsha1 = false,
                b"recordedinput" => reading_recorded = false,
                b"test" => {
                    if let Some(mut test) = current.take() {
                        test.tvsha1 = test.tvsha1.trim().to_string();
                        test.recordedinput = test.recordedinput.trim().to_string();
                        tests.push(test);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                anyhow::bail!("failed to parse suite XML: {err}");
            }
            _ => {}
        }
    }

    Ok(tests)
}

fn append_text(test: Option<&mut SuiteTest>, tvsha1: bool, recorded: bool, text: &str) {
    if let Some(test) = test {
        if tvsha1 {
            test.tvsha1.push_str(text);
        } else if recorded {
            test.recordedinput.push_str(text);
        }
    }
}

fn matches_filter(name: &str, cfg: &Config) -> bool {
    if cfg.contains.is_empty() {
        return true;
    }
    let lower = name.to_lowercase();
    cfg.contains.iter().any(|f| lower.contains(f))
}

/// Suite entries needing replayed input or a PAL console cannot run here.
fn suite_test_supported(test: &SuiteTest) -> bool {
    !test.system.eq_ignore_ascii_case("pal") && test.recordedinput.is_empty()
}

fn hash_frame_rgb(rgb: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha1::digest(rgb))
}

fn hash_frame_rgba(rgb: &[u8]) -> String {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for px in rgb.chunks_exact(3) {
        rgba.extend_from_slice(px);
        rgba.push(0xFF);
    }
    BASE64_STANDARD.encode(Sha1::digest(&rgba))
}

fn record(rom: &Path, nes: &Nes, verdict: Verdict, outcome: Option<&blargg::Outcome>) -> RunRecord {
    let counters = nes.debug_counters();
    RunRecord {
        rom: rom.display().to_string(),
        verdict,
        code: outcome.and_then(|o| o.code),
        message: outcome.map(|o| o.message.clone()).unwrap_or_default(),
        instructions: outcome.map_or(counters.cpu_steps, |o| o.instructions),
        cycles: nes.debug_total_cycles(),
        frames: counters.frame_count,
        unofficial_opcodes: counters.unofficial_opcode_count,
        frame_sha1: Some(hash_frame_rgb(&nes.frame_rgb())),
    }
}

fn skipped(rom: &Path, reason: String) -> RunRecord {
    RunRecord {
        rom: rom.display().to_string(),
        verdict: Verdict::Skip,
        code: None,
        message: reason,
        instructions: 0,
        cycles: 0,
        frames: 0,
        unofficial_opcodes: 0,
        frame_sha1: None,
    }
}

fn run_self_checking(path: &Path, cfg: &Config) -> Result<RunRecord> {
    let mut nes = Nes::new();
    nes.load_rom_from_path(path)?;
    let outcome = blargg::run(&mut nes, cfg.max_instructions)?;
    let verdict = match outcome.code {
        Some(0) => Verdict::Pass,
        Some(_) => Verdict::Fail,
        None => Verdict::Timeout,
    };
    Ok(record(path, &nes, verdict, Some(&outcome)))
}

fn run_suite_test(test: &SuiteTest, cfg: &Config) -> Result<RunRecord> {
    let rom_path = cfg.rom_root.join(&test.filename);
    let mut nes = Nes::new();
    nes.load_rom_from_path(&rom_path)?;
    for _ in 0..test.runframes {
        nes.run_frame()?;
    }

    let rgb = nes.frame_rgb();
    let hash_matches = test.tvsha1 == hash_frame_rgb(&rgb) || test.tvsha1 == hash_frame_rgba(&rgb);
    // Many suite ROMs also report through $6000; accept that when present.
    let self_check = match blargg::status(&nes) {
        blargg::Status::Finished(code) => Some(code),
        _ => None,
    };
    let verdict = if hash_matches || self_check == Some(0) {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    let mut run = record(&rom_path, &nes, verdict, None);
    run.code = self_check;
    if self_check.is_some() {
        run.message = blargg::message(&nes);
    }
    Ok(run)
}

fn collect_roms(cfg: &Config) -> Result<Vec<PathBuf>> {
    let mut roms = cfg.roms.clone();
    if let Some(dir) = &cfg.dir {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("failed to read ROM directory: {}", dir.display()))?
        {
            let path = entry?.path();
            let is_nes = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("nes"));
            if is_nes {
                found.push(path);
            }
        }
        found.sort();
        roms.extend(found);
    }
    roms.retain(|path| matches_filter(&path.display().to_string(), cfg));
    Ok(roms)
}

fn print_run(label: &str, run: &RunRecord) {
    match run.verdict {
        Verdict::Pass => println!("PASS {label}"),
        Verdict::Skip => println!("SKIP {label} -> {}", run.message),
        Verdict::Timeout => println!(
            "TIMEOUT {label} after {} instructions, no result at $6000",
            run.instructions
        ),
        Verdict::Fail => {
            println!(
                "FAIL {label}\n  code={} instructions={} cycles={} frames={} unofficial_opcodes={}\n  frame_sha1={}",
                run.code
                    .map(|code| format!("${code:02X}"))
                    .unwrap_or_else(|| "-".to_string()),
                run.instructions,
                run.cycles,
                run.frames,
                run.unofficial_opcodes,
                run.frame_sha1.as_deref().unwrap_or("-")
            );
            for line in run.message.lines() {
                println!("  | {line}");
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::filter::Targets::new()
                .with_target("famicore", tracing_subscriber::filter::LevelFilter::WARN)
                .with_target("rom_test_runner", tracing_subscriber::filter::LevelFilter::DEBUG),
        )
        .init();

    let cfg = parse_args()?;
    let start = Instant::now();
    let mut runs = Vec::new();

    let roms: Vec<PathBuf> = collect_roms(&cfg)?.into_iter().take(cfg.max_tests).collect();
    if !roms.is_empty() {
        println!("Running {} self-checking ROM(s)", roms.len());
    }
    for (idx, path) in roms.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, roms.len(), path.display());
        let run = run_self_checking(path, &cfg).unwrap_or_else(|err| {
            warn!("{label}: {err:#}");
            skipped(path, format!("{err:#}"))
        });
        print_run(&label, &run);
        runs.push(run);
    }

    if let Some(suite) = &cfg.suite {
        let selected: Vec<SuiteTest> = parse_suite_xml(suite)?
            .into_iter()
            .filter(|t| suite_test_supported(t) && matches_filter(&t.filename, &cfg))
            .take(cfg.max_tests)
            .collect();
        println!("Running {} test(s) from {}", selected.len(), suite.display());

        for (idx, test) in selected.iter().enumerate() {
            let label = format!("[{}/{}] {}", idx + 1, selected.len(), test.filename);
            debug!(runframes = test.runframes, "{label}");
            let run = run_suite_test(test, &cfg).unwrap_or_else(|err| {
                skipped(&cfg.rom_root.join(&test.filename), format!("{err:#}"))
            });
            if run.verdict == Verdict::Fail {
                println!("  expected: {}", test.tvsha1);
            }
            print_run(&label, &run);
            runs.push(run);
        }
    }

    let count = |verdict: Verdict| runs.iter().filter(|run| run.verdict == verdict).count();
    let report = Report {
        passed: count(Verdict::Pass),
        failed: count(Verdict::Fail),
        timed_out: count(Verdict::Timeout),
        skipped: count(Verdict::Skip),
        runtime_secs: start.elapsed().as_secs_f32(),
        runs,
    };

    println!();
    println!("Summary:");
    println!("- Passed: {}", report.passed);
    println!("- Failed: {}", report.failed);
    println!("- Timed out: {}", report.timed_out);
    println!("- Skipped: {}", report.skipped);
    println!("- Runtime: {:.2}s", report.runtime_secs);

    if let Some(path) = &cfg.json {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to create report: {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if report.failed + report.timed_out > 0 {
        anyhow::bail!("{} test(s) did not pass", report.failed + report.timed_out);
    }
    Ok(())
}
