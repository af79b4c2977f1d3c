use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eframe::egui::{self, ColorImage, Key, TextureHandle, TextureOptions};
use tracing::{error, info};

use crate::nes::ppu::{FRAME_HEIGHT, FRAME_WIDTH};
use crate::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, Nes,
};

const REPAINT_INTERVAL: Duration = Duration::from_millis(4);

pub struct NesApp {
    nes: Nes,
    frame_texture: Option<TextureHandle>,
    status_line: String,
    loaded_rom: Option<PathBuf>,
    last_update: Option<Instant>,
    paused: bool,
    /// Set when the core reported a fatal error; emulation stays stopped
    /// until the next reset or ROM load.
    halted: bool,
}

impl NesApp {
    pub fn new(cc: &eframe::CreationContext<'_>) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        Self {
            nes: Nes::new(),
            frame_texture: None,
            status_line: "Drop a .nes file or click Open ROM".to_string(),
            loaded_rom: None,
            last_update: None,
            paused: false,
            halted: false,
        }
    }

    fn load_rom(&mut self, path: &Path) {
        match self.nes.load_rom_from_path(path) {
            Ok(()) => {
                info!(path = %path.display(), mapper = self.nes.mapper_name(), "ROM loaded");
                self.loaded_rom = Some(path.to_path_buf());
                self.status_line = format!(
                    "Loaded {} using {}",
                    path.file_name().and_then(|f| f.to_str()).unwrap_or("ROM"),
                    self.nes.mapper_name()
                );
                self.frame_texture = None;
                self.last_update = None;
                self.halted = false;
            }
            Err(err) => {
                error!("failed to load ROM: {err:#}");
                self.status_line = format!("Failed to load ROM: {err:#}");
            }
        }
    }

    fn reset(&mut self) {
        match self.nes.reset() {
            Ok(()) => {
                self.status_line = "Reset complete".to_string();
                self.halted = false;
            }
            Err(err) => self.status_line = format!("Reset failed: {err}"),
        }
        self.last_update = None;
    }

    fn toggle_pause(&mut self) {
        self.paused = !self.paused;
        self.last_update = None;
    }

    fn open_rom_dialog(&mut self) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("NES ROM", &["nes"])
            .set_title("Open NES ROM")
            .pick_file()
        {
            self.load_rom(&path);
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|input| input.raw.dropped_files.clone());
        for file in dropped {
            if let Some(path) = file.path {
                let is_nes = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("nes"))
                    .unwrap_or(false);

                if is_nes {
                    self.load_rom(&path);
                } else {
                    self.status_line = format!("Unsupported file: {}", path.display());
                }
            }
        }
    }

    fn handle_shortcuts(&mut self, ctx: &egui::Context) {
        let open_shortcut = ctx.input(|i| i.modifiers.command && i.key_pressed(Key::O));
        if open_shortcut {
            self.open_rom_dialog();
        }

        let reset = ctx.input(|i| i.key_pressed(Key::R));
        if reset && self.nes.has_rom() {
            self.reset();
        }

        let pause_toggle = ctx.input(|i| i.key_pressed(Key::P));
        if pause_toggle && self.nes.has_rom() {
            self.toggle_pause();
        }
    }

    fn controller_state_from_input(ctx: &egui::Context) -> u8 {
        let mut state = 0u8;

        ctx.input(|input| {
            let bindings = [
                (Key::W, BUTTON_UP),
                (Key::S, BUTTON_DOWN),
                (Key::A, BUTTON_LEFT),
                (Key::D, BUTTON_RIGHT),
                (Key::ArrowUp, BUTTON_UP),
                (Key::ArrowDown, BUTTON_DOWN),
                (Key::ArrowLeft, BUTTON_LEFT),
                (Key::ArrowRight, BUTTON_RIGHT),
                (Key::Space, BUTTON_A),
                (Key::Z, BUTTON_A),
                (Key::X, BUTTON_B),
                (Key::Enter, BUTTON_START),
            ];
            for (key, button) in bindings {
                if input.key_down(key) {
                    state |= button;
                }
            }
            if input.modifiers.shift {
                state |= BUTTON_SELECT;
            }
        });

        state
    }

    fn update_texture(&mut self, ctx: &egui::Context) {
        let rgb = self.nes.frame_rgb();
        let image = ColorImage::from_rgb([FRAME_WIDTH, FRAME_HEIGHT], &rgb);

        if let Some(texture) = self.frame_texture.as_mut() {
            texture.set(image, TextureOptions::NEAREST);
        } else {
            self.frame_texture =
                Some(ctx.load_texture("nes-frame", image, TextureOptions::NEAREST));
        }
    }

    /// Feeds elapsed wall time to the core as a CPU cycle budget.
    fn run_emulation(&mut self, ctx: &egui::Context, now: Instant) {
        let elapsed = self
            .last_update
            .map(|prev| now.saturating_duration_since(prev))
            .unwrap_or_default();
        self.last_update = Some(now);

        self.nes
            .set_controller_state(Self::controller_state_from_input(ctx));
        if let Err(err) = self.nes.run_for(elapsed) {
            error!("emulation halted: {err}");
            self.status_line = format!("Emulation halted: {err}");
            self.halted = true;
        }
    }
}

impl eframe::App for NesApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_dropped_files(ctx);
        self.handle_shortcuts(ctx);

        let now = Instant::now();
        if self.nes.has_rom() && !self.paused && !self.halted {
            self.run_emulation(ctx, now);
        }

        self.update_texture(ctx);

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Open ROM").clicked() {
                    self.open_rom_dialog();
                }

                let has_rom = self.nes.has_rom();
                if ui
                    .add_enabled(has_rom, egui::Button::new("Reset (R)"))
                    .clicked()
                {
                    self.reset();
                }

                if ui
                    .add_enabled(
                        has_rom,
                        egui::Button::new(if self.paused {
                            "Resume (P)"
                        } else {
                            "Pause (P)"
                        }),
                    )
                    .clicked()
                {
                    self.toggle_pause();
                }

                if let Some(path) = &self.loaded_rom {
                    ui.separator();
                    ui.label(path.display().to_string());
                }
            });
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal_wrapped(|ui| {
                ui.label(&self.status_line);
                ui.separator();
                ui.label(format!("Mapper: {}", self.nes.mapper_name()));
                ui.separator();
                ui.label(
                    "Controls: WASD/arrows move, Space/Z = A, X = B, Enter = Start, Shift = Select, P = Pause",
                );
            });

            ui.separator();
            let regs = self.nes.debug_cpu_regs();
            let (ctrl, mask, status) = self.nes.debug_ppu_regs();
            let (sl, cy) = self.nes.debug_ppu_scanline_cycle();
            let debug = self.nes.debug_counters();
            ui.collapsing("Debug", |ui| {
                ui.monospace(format!(
                    "CPU A={:02X} X={:02X} Y={:02X} P={:02X} SP={:02X} PC={:04X}",
                    regs.a,
                    regs.x,
                    regs.y,
                    regs.status(),
                    regs.sp,
                    regs.pc
                ));
                ui.monospace(format!(
                    "Core frames={} cpu_steps={} cycles={} dma_transfers={} nmi={} irq={} unofficial={}",
                    debug.frame_count,
                    debug.cpu_steps,
                    self.nes.debug_total_cycles(),
                    debug.dma_transfers,
                    debug.nmi_count,
                    debug.irq_count,
                    debug.unofficial_opcode_count
                ));
                ui.monospace(format!(
                    "PPU sl={} cy={} ctrl=${:02X} mask=${:02X} status=${:02X} v=${:04X} ppu_cycles={}",
                    sl,
                    cy,
                    ctrl,
                    mask,
                    status,
                    self.nes.debug_ppu_vram_addr(),
                    debug.ppu_cycles
                ));

                let events = self.nes.debug_recent_events(8);
                if !events.is_empty() {
                    ui.separator();
                    ui.label("Recent events:");
                    for event in events {
                        ui.monospace(event);
                    }
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                let available = ui.available_size();
                let scale_x = (available.x / FRAME_WIDTH as f32).max(1.0);
                let scale_y = (available.y / FRAME_HEIGHT as f32).max(1.0);
                let scale = scale_x.min(scale_y).floor().max(1.0);
                let target = egui::vec2(FRAME_WIDTH as f32 * scale, FRAME_HEIGHT as f32 * scale);

                if let Some(texture) = &self.frame_texture {
                    ui.add(egui::Image::new(texture).fit_to_exact_size(target));
                }

                ui.add_space(8.0);
                ui.label("Drag and drop a ROM to start.");
            });
        });

        ctx.request_repaint_after(REPAINT_INTERVAL);
    }
}
