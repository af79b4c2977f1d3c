//! CPU/PPU interleaving policy.
//!
//! Every CPU tick is followed by three PPU steps. NMI delivery and frame
//! completion are decided here from the checkpoints the PPU reports, so any
//! driver (window, test runner, debugger) gets identical behaviour.

use std::time::Duration;

use super::error::CoreError;
use super::ppu::Checkpoint;

pub const CPU_CLOCK_HZ: u64 = 1_789_773;
pub const PPU_STEPS_PER_CPU_TICK: u32 = 3;

/// Default ceiling on how much wall time a single [`CycleBudget::add_elapsed`]
/// may convert. Keeps a stalled window from replaying seconds of emulation.
pub const DEFAULT_MAX_CATCH_UP: Duration = Duration::from_millis(50);

/// A machine the coordinator can drive.
pub trait Clocked {
    /// Runs one CPU step and returns the ticks it consumed.
    fn step_cpu(&mut self) -> Result<u32, CoreError>;
    fn step_ppu(&mut self) -> Result<Option<Checkpoint>, CoreError>;
    fn nmi_enabled(&self) -> bool;
    fn trigger_nmi(&mut self) -> Result<(), CoreError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub cpu_ticks: u64,
    pub frames_completed: u32,
    pub nmis_fired: u32,
    /// Budget left after the last step. Zero or negative once the run ends,
    /// since an instruction is never split.
    pub remaining_budget: i64,
}

/// One CPU step followed by its PPU steps. Returns the ticks consumed.
pub fn step_once<C: Clocked + ?Sized>(
    system: &mut C,
    report: &mut RunReport,
) -> Result<u32, CoreError> {
    let ticks = system.step_cpu()?;
    report.cpu_ticks += ticks as u64;
    for _ in 0..ticks * PPU_STEPS_PER_CPU_TICK {
        match system.step_ppu()? {
            Some(Checkpoint::VblankStart) if system.nmi_enabled() => {
                system.trigger_nmi()?;
                report.nmis_fired += 1;
            }
            Some(Checkpoint::FrameEnd) => report.frames_completed += 1,
            _ => {}
        }
    }
    Ok(ticks)
}

/// Steps whole instructions while `budget` is positive.
pub fn run_budget<C: Clocked + ?Sized>(system: &mut C, budget: i64) -> Result<RunReport, CoreError> {
    let mut report = RunReport {
        remaining_budget: budget,
        ..RunReport::default()
    };
    while report.remaining_budget > 0 {
        let ticks = step_once(system, &mut report)?;
        report.remaining_budget -= ticks as i64;
    }
    Ok(report)
}

/// Converts wall-clock time into CPU cycles and carries both the fractional
/// cycle and any overshoot from one run into the next.
#[derive(Debug, Clone)]
pub struct CycleBudget {
    pending: i64,
    fraction: f64,
    max_catch_up: Duration,
}

impl Default for CycleBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CATCH_UP)
    }
}

impl CycleBudget {
    pub fn new(max_catch_up: Duration) -> Self {
        Self {
            pending: 0,
            fraction: 0.0,
            max_catch_up,
        }
    }

    /// Adds `elapsed` (clamped) worth of cycles and returns the pending budget.
    pub fn add_elapsed(&mut self, elapsed: Duration) -> i64 {
        let clamped = elapsed.min(self.max_catch_up);
        let exact = clamped.as_secs_f64() * CPU_CLOCK_HZ as f64 + self.fraction;
        let whole = exact.floor();
        self.fraction = exact - whole;
        self.pending += whole as i64;
        self.pending
    }

    pub fn pending(&self) -> i64 {
        self.pending
    }

    pub fn clear(&mut self) {
        self.pending = 0;
        self.fraction = 0.0;
    }

    pub fn run<C: Clocked + ?Sized>(&mut self, system: &mut C) -> Result<RunReport, CoreError> {
        let report = run_budget(system, self.pending)?;
        self.pending = report.remaining_budget;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted machine: CPU steps cycle through `ticks`, PPU checkpoints fire
    /// at fixed PPU step numbers.
    struct Scripted {
        ticks: Vec<u32>,
        next: usize,
        ppu_steps: u64,
        checkpoints: Vec<(u64, Checkpoint)>,
        nmi_enabled: bool,
        nmis: u32,
        nmi_at_ppu_step: Vec<u64>,
    }

    impl Scripted {
        fn new(ticks: &[u32]) -> Self {
            Self {
                ticks: ticks.to_vec(),
                next: 0,
                ppu_steps: 0,
                checkpoints: Vec::new(),
                nmi_enabled: false,
                nmis: 0,
                nmi_at_ppu_step: Vec::new(),
            }
        }
    }

    impl Clocked for Scripted {
        fn step_cpu(&mut self) -> Result<u32, CoreError> {
            let ticks = self.ticks[self.next % self.ticks.len()];
            self.next += 1;
            Ok(ticks)
        }

        fn step_ppu(&mut self) -> Result<Option<Checkpoint>, CoreError> {
            let step = self.ppu_steps;
            self.ppu_steps += 1;
            Ok(self
                .checkpoints
                .iter()
                .find(|(at, _)| *at == step)
                .map(|(_, checkpoint)| *checkpoint))
        }

        fn nmi_enabled(&self) -> bool {
            self.nmi_enabled
        }

        fn trigger_nmi(&mut self) -> Result<(), CoreError> {
            self.nmis += 1;
            self.nmi_at_ppu_step.push(self.ppu_steps);
            Ok(())
        }
    }

    #[test]
    fn three_ppu_steps_per_cpu_tick() {
        let mut system = Scripted::new(&[2, 3, 7]);
        let report = run_budget(&mut system, 10).unwrap();
        assert_eq!(report.cpu_ticks, 12);
        assert_eq!(system.ppu_steps, 36);
        assert_eq!(report.remaining_budget, -2);
        assert_eq!(system.next, 3);
    }

    #[test]
    fn empty_budget_runs_nothing() {
        let mut system = Scripted::new(&[2]);
        let report = run_budget(&mut system, 0).unwrap();
        assert_eq!(report, RunReport::default());
        assert_eq!(system.ppu_steps, 0);
    }

    #[test]
    fn nmi_fires_on_vblank_only_when_enabled() {
        let mut system = Scripted::new(&[1]);
        system.checkpoints = vec![(4, Checkpoint::VblankStart), (10, Checkpoint::PreRender)];
        let report = run_budget(&mut system, 5).unwrap();
        assert_eq!(report.nmis_fired, 0);
        assert_eq!(system.nmis, 0);

        let mut system = Scripted::new(&[1]);
        system.nmi_enabled = true;
        system.checkpoints = vec![(4, Checkpoint::VblankStart), (10, Checkpoint::PreRender)];
        let report = run_budget(&mut system, 5).unwrap();
        assert_eq!(report.nmis_fired, 1);
        assert_eq!(system.nmi_at_ppu_step, vec![5]);
    }

    #[test]
    fn frame_end_is_counted() {
        let mut system = Scripted::new(&[4]);
        system.checkpoints = vec![(0, Checkpoint::FrameEnd), (30, Checkpoint::FrameEnd)];
        let report = run_budget(&mut system, 12).unwrap();
        assert_eq!(report.frames_completed, 2);
        assert_eq!(report.cpu_ticks, 12);
    }

    #[test]
    fn cycle_budget_converts_wall_time() {
        let mut budget = CycleBudget::new(Duration::from_secs(2));
        assert_eq!(budget.add_elapsed(Duration::from_secs(1)), CPU_CLOCK_HZ as i64);
    }

    #[test]
    fn cycle_budget_clamps_catch_up() {
        let mut budget = CycleBudget::new(Duration::from_millis(10));
        let pending = budget.add_elapsed(Duration::from_secs(3));
        assert_eq!(pending, 17_897);
    }

    #[test]
    fn cycle_budget_keeps_fraction_and_overshoot() {
        let mut budget = CycleBudget::default();
        for _ in 0..1000 {
            budget.add_elapsed(Duration::from_micros(1));
        }
        assert_eq!(budget.pending(), 1789);

        let mut system = Scripted::new(&[7]);
        let report = budget.run(&mut system).unwrap();
        assert!(report.remaining_budget <= 0);
        assert!(report.remaining_budget > -7);
        assert_eq!(budget.pending(), report.remaining_budget);

        budget.clear();
        assert_eq!(budget.pending(), 0);
    }
}
