use anyhow::{Context, Result, bail};
use famicore::nes::Nes;
use std::io::Write as _;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const NESTEST_ENTRY: u16 = 0xC000;
const NESTEST_DEFAULT_LINES: usize = 5259;

#[derive(Debug, Clone)]
struct Config {
    rom: PathBuf,
    nestest: bool,
    nestest_lines: usize,
}

fn parse_args() -> Result<Option<Config>> {
    let mut rom = None;
    let mut nestest = false;
    let mut nestest_lines = NESTEST_DEFAULT_LINES;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--nestest" => nestest = true,
            "--lines" => {
                let value = args
                    .next()
                    .context("--lines requires an integer, e.g. --lines 100")?;
                nestest_lines = value
                    .parse::<usize>()
                    .with_context(|| format!("invalid --lines value: {value}"))?;
            }
            "--help" | "-h" => return Ok(None),
            other if other.starts_with("--") => {
                bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
            path => rom = Some(PathBuf::from(path)),
        }
    }

    Ok(rom.map(|rom| Config {
        rom,
        nestest,
        nestest_lines,
    }))
}

fn print_usage() {
    println!("Usage: famicore_debug <rom.nes> [--nestest [--lines <n>]]");
    println!();
    println!("  --nestest     Start at $C000 and print golden-log trace lines, then exit");
    println!("  --lines <n>   Number of trace lines in --nestest mode (default {NESTEST_DEFAULT_LINES})");
}

fn print_help() {
    println!("Commands:");
    println!("  step, s [n]   - Step n instructions (default 1), printing each trace line");
    println!("  frame, f [n]  - Run n frames (default 1)");
    println!("  until <addr>  - Step until PC reaches addr");
    println!("  trace         - Toggle tracing of every instruction");
    println!("  regs          - Show CPU registers");
    println!("  mem <addr>    - Show 16 bytes of CPU memory (hex)");
    println!("  ppu           - Show PPU state");
    println!("  events [n]    - Show recent core events");
    println!("  reset         - Press reset");
    println!("  quit, q       - Exit debugger");
}

fn parse_addr(text: &str) -> Option<u16> {
    let digits = text.trim_start_matches("0x").trim_start_matches('$');
    u16::from_str_radix(digits, 16).ok()
}

fn run_nestest(nes: &mut Nes, lines: usize) -> Result<()> {
    nes.set_pc(NESTEST_ENTRY);
    let mut out = std::io::stdout().lock();
    for _ in 0..lines {
        writeln!(out, "{}", nes.trace_line()?)?;
        nes.step_instruction()?;
    }
    writeln!(
        out,
        "; result $02=${:02X} $03=${:02X}",
        nes.peek(0x0002),
        nes.peek(0x0003)
    )?;
    Ok(())
}

fn print_regs(nes: &Nes) {
    let regs = nes.debug_cpu_regs();
    let p = regs.status();
    println!("A: ${:02X}  X: ${:02X}  Y: ${:02X}", regs.a, regs.x, regs.y);
    println!("P: {:08b} (NV-BDIZC)", p);
    println!("SP: ${:02X}  PC: ${:04X}", regs.sp, regs.pc);
    println!(
        "Flags: N={} V={} D={} I={} Z={} C={}",
        (p & 0x80) != 0,
        (p & 0x40) != 0,
        (p & 0x08) != 0,
        (p & 0x04) != 0,
        (p & 0x02) != 0,
        (p & 0x01) != 0
    );
    println!("Cycles: {}", nes.debug_total_cycles());
}

fn print_mem(nes: &Nes, addr: u16) {
    println!("Memory ${:04X}-${:04X}:", addr, addr.wrapping_add(15));
    for row in 0..2u16 {
        let base = addr.wrapping_add(row * 8);
        let bytes: Vec<String> = (0..8u16)
            .map(|i| format!("{:02X}", nes.peek(base.wrapping_add(i))))
            .collect();
        println!("{:04X}: {}", base, bytes.join(" "));
    }
}

fn print_ppu(nes: &Nes) {
    let (scanline, cycle) = nes.debug_ppu_scanline_cycle();
    let (ctrl, mask, status) = nes.debug_ppu_regs();
    println!("PPU State:");
    println!("  Scanline: {}, Cycle: {}", scanline, cycle);
    println!("  $2000 (ctrl):   {:08b}", ctrl);
    println!("  $2001 (mask):   {:08b}", mask);
    println!("  $2002 (status): {:08b}", status);
    println!("  v: ${:04X}", nes.debug_ppu_vram_addr());
    println!("  Frames: {}", nes.debug_counters().frame_count);
}

fn step(nes: &mut Nes, count: usize, trace: bool) -> Result<()> {
    for _ in 0..count {
        if trace {
            println!("{}", nes.trace_line()?);
        }
        nes.step_instruction()?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::filter::Targets::new()
                .with_target("famicore", tracing_subscriber::filter::LevelFilter::DEBUG),
        )
        .init();

    let Some(cfg) = parse_args()? else {
        print_usage();
        println!();
        print_help();
        return Ok(());
    };

    let mut nes = Nes::new();
    nes.load_rom_from_path(&cfg.rom)?;

    if cfg.nestest {
        return run_nestest(&mut nes, cfg.nestest_lines);
    }

    println!("Famicore Debugger");
    println!("=================");
    println!();
    println!("ROM: {}", cfg.rom.display());
    println!("Mapper: {}", nes.mapper_name());
    println!();
    println!("{}", nes.trace_line()?);
    println!();
    println!("Type 'help' for commands");

    let mut trace = false;
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        let count = parts
            .get(1)
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(1);

        let result = match parts[0] {
            "help" | "h" => {
                print_help();
                Ok(())
            }
            "step" | "s" => step(&mut nes, count, true).and_then(|()| {
                println!("{}", nes.trace_line()?);
                Ok(())
            }),
            "frame" | "f" => (0..count).try_for_each(|_| {
                if trace {
                    let before = nes.debug_counters().frame_count;
                    while nes.debug_counters().frame_count == before {
                        step(&mut nes, 1, true)?;
                    }
                    Ok(())
                } else {
                    nes.run_frame().map_err(anyhow::Error::from)
                }
            }),
            "until" => match parts.get(1).and_then(|text| parse_addr(text)) {
                Some(target) => {
                    let mut steps = 0usize;
                    let mut result = Ok(());
                    while nes.debug_cpu_regs().pc != target && steps < 10_000_000 {
                        if let Err(err) = step(&mut nes, 1, trace) {
                            result = Err(err);
                            break;
                        }
                        steps += 1;
                    }
                    println!("{} instruction(s) executed", steps);
                    result
                }
                None => {
                    println!("Usage: until <addr>");
                    Ok(())
                }
            },
            "trace" => {
                trace = !trace;
                println!("Tracing {}", if trace { "on" } else { "off" });
                Ok(())
            }
            "regs" => {
                print_regs(&nes);
                Ok(())
            }
            "mem" => {
                match parts.get(1).and_then(|text| parse_addr(text)) {
                    Some(addr) => print_mem(&nes, addr),
                    None => println!("Usage: mem <addr>"),
                }
                Ok(())
            }
            "ppu" => {
                print_ppu(&nes);
                Ok(())
            }
            "events" => {
                for event in nes.debug_recent_events(parts.get(1).map_or(16, |_| count)) {
                    println!("  {event}");
                }
                Ok(())
            }
            "reset" => nes.reset().map_err(anyhow::Error::from),
            "quit" | "q" => {
                println!("Goodbye!");
                break;
            }
            _ => {
                println!(
                    "Unknown command: {}. Type 'help' for available commands.",
                    parts[0]
                );
                Ok(())
            }
        };

        if let Err(err) = result {
            println!("Error: {err:#}");
        }
    }

    Ok(())
}
