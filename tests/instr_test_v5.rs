use std::path::Path;

use famicore::nes::{Nes, blargg};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const ROM_DIR: &str = "tests/roms/instr_test-v5/rom_singles";
const MAX_INSTRUCTIONS: u64 = 200_000_000;

/// Singles that only use official opcodes.
const ROMS: [&str; 9] = [
    "01-basics.nes",
    "02-implied.nes",
    "10-branches.nes",
    "11-stack.nes",
    "12-jmp_jsr.nes",
    "13-rts.nes",
    "14-rti.nes",
    "15-brk.nes",
    "16-special.nes",
];

#[test]
#[ignore = "needs tests/roms/instr_test-v5"]
fn instr_test_v5() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::filter::Targets::new()
                .with_target("famicore", tracing_subscriber::filter::LevelFilter::INFO)
                .with_target(
                    "instr_test_v5",
                    tracing_subscriber::filter::LevelFilter::TRACE,
                ),
        )
        .init();

    for name in ROMS {
        let path = Path::new(ROM_DIR).join(name);
        info!("running test: {name}");

        let mut nes = Nes::new();
        nes.load_rom_from_path(&path).unwrap();
        let outcome = blargg::run(&mut nes, MAX_INSTRUCTIONS).unwrap();
        for line in outcome.message.lines() {
            info!("test output: {line:?}");
        }

        assert_eq!(
            outcome.code,
            Some(0),
            "{name} failed after {} instructions: {}",
            outcome.instructions,
            outcome.message
        );
    }
}
