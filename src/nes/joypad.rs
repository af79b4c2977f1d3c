/// Button order matches the serial read order of the controller port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    A = 0,
    B = 1,
    Select = 2,
    Start = 3,
    Up = 4,
    Down = 5,
    Left = 6,
    Right = 7,
}

#[derive(Debug, Clone, Default)]
pub struct Joypad {
    buttons: [bool; 8],
    strobe: bool,
    read_count: u8,
}

impl Joypad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.buttons[button as usize] = pressed;
    }

    pub fn set_buttons(&mut self, buttons: [bool; 8]) {
        self.buttons = buttons;
    }

    /// Bit `n` of `mask` is the button at read position `n`.
    pub fn set_from_mask(&mut self, mask: u8) {
        for (bit, pressed) in self.buttons.iter_mut().enumerate() {
            *pressed = (mask >> bit) & 0x01 != 0;
        }
    }

    pub fn buttons(&self) -> [bool; 8] {
        self.buttons
    }

    pub fn strobe(&self) -> bool {
        self.strobe
    }

    pub fn write(&mut self, value: u8) {
        let strobe = (value & 0x01) != 0;
        if self.strobe && !strobe {
            self.read_count = 0;
        }
        self.strobe = strobe;
    }

    pub fn read(&mut self) -> u8 {
        if self.strobe {
            return u8::from(self.buttons[Button::A as usize]);
        }
        self.read_count = self.read_count.saturating_add(1);
        self.bit_for_count(self.read_count)
    }

    /// What the next `read` would return, without advancing the shift position.
    pub fn peek(&self) -> u8 {
        if self.strobe {
            return u8::from(self.buttons[Button::A as usize]);
        }
        self.bit_for_count(self.read_count.saturating_add(1))
    }

    fn bit_for_count(&self, count: u8) -> u8 {
        match count {
            1..=8 => 0x40 | u8::from(self.buttons[count as usize - 1]),
            _ => 0x41,
        }
    }
}
