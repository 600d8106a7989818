//! Minimal ESC/POS command builder for thermal printers.
//!
//! Produces raw byte buffers for kitchen tickets and bills. Text is encoded
//! as CP860 (Portuguese) so accented menu names print correctly.

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;
const LF: u8 = 0x0A;

/// `ESC t` page number for PC860 on Epson-compatible printers.
const CODE_PAGE_PC860: u8 = 3;

/// Paper width in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperWidth {
    Mm58,
    Mm80,
}

impl PaperWidth {
    pub fn chars(self) -> usize {
        match self {
            PaperWidth::Mm58 => 32,
            PaperWidth::Mm80 => 48,
        }
    }

    pub fn from_mm(mm: i32) -> Self {
        if mm <= 58 {
            PaperWidth::Mm58
        } else {
            PaperWidth::Mm80
        }
    }
}

/// Builder for ESC/POS buffers.
///
/// ```rust,ignore
/// let mut b = EscPosBuilder::new();
/// b.init().portuguese().center().bold(true).text("MESA 7\n").bold(false);
/// b.feed(3).cut();
/// let bytes = b.build();
/// ```
pub struct EscPosBuilder {
    buffer: Vec<u8>,
    paper: PaperWidth,
}

impl Default for EscPosBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EscPosBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
            paper: PaperWidth::Mm80,
        }
    }

    pub fn with_paper(mut self, paper: PaperWidth) -> Self {
        self.paper = paper;
        self
    }

    pub fn paper(&self) -> PaperWidth {
        self.paper
    }

    /// ESC @: reset printer.
    pub fn init(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x40]);
        self
    }

    /// ESC t n: select character code page.
    pub fn code_page(&mut self, page: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x74, page]);
        self
    }

    /// Select PC860 to match the text encoding.
    pub fn portuguese(&mut self) -> &mut Self {
        self.code_page(CODE_PAGE_PC860)
    }

    /// ESC E n: bold on/off.
    pub fn bold(&mut self, on: bool) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x45, u8::from(on)]);
        self
    }

    /// GS ! n: text size, width and height multipliers 1-8.
    pub fn text_size(&mut self, width: u8, height: u8) -> &mut Self {
        let w = width.clamp(1, 8) - 1;
        let h = height.clamp(1, 8) - 1;
        self.buffer.extend_from_slice(&[GS, 0x21, (w << 4) | h]);
        self
    }

    pub fn normal_size(&mut self) -> &mut Self {
        self.text_size(1, 1)
    }

    pub fn double_height(&mut self) -> &mut Self {
        self.text_size(1, 2)
    }

    /// ESC a 0
    pub fn left(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x61, 0]);
        self
    }

    /// ESC a 1
    pub fn center(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x61, 1]);
        self
    }

    pub fn text(&mut self, s: &str) -> &mut Self {
        self.buffer.extend(encode_cp860(s));
        self
    }

    pub fn lf(&mut self) -> &mut Self {
        self.buffer.push(LF);
        self
    }

    /// Dashed rule across the paper width.
    pub fn separator(&mut self) -> &mut Self {
        self.buffer
            .extend(std::iter::repeat(b'-').take(self.paper.chars()));
        self.buffer.push(LF);
        self
    }

    /// Left-aligned label and right-aligned value on one line. Widths are
    /// counted in characters since every encoded char is one byte.
    pub fn line_pair(&mut self, label: &str, value: &str) -> &mut Self {
        let width = self.paper.chars();
        let used = label.chars().count() + value.chars().count();
        let gap = width.saturating_sub(used).max(1);
        self.text(label);
        self.buffer.extend(std::iter::repeat(b' ').take(gap));
        self.text(value);
        self.lf()
    }

    /// ESC d n: feed n lines.
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x64, lines]);
        self
    }

    /// GS V A 16: partial cut.
    pub fn cut(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[GS, 0x56, 0x41, 0x10]);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// CP860 encoding
// ---------------------------------------------------------------------------

/// ASCII passes through, Portuguese letters map to CP860 and anything else
/// becomes `?`.
fn encode_cp860(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| {
            let code = ch as u32;
            if code < 0x80 {
                code as u8
            } else {
                to_cp860(ch).unwrap_or(b'?')
            }
        })
        .collect()
}

fn to_cp860(ch: char) -> Option<u8> {
    let byte = match ch {
        'Ç' => 0x80,
        'ü' => 0x81,
        'é' => 0x82,
        'â' => 0x83,
        'ã' => 0x84,
        'à' => 0x85,
        'Á' => 0x86,
        'ç' => 0x87,
        'ê' => 0x88,
        'Ê' => 0x89,
        'è' => 0x8A,
        'Í' => 0x8B,
        'Ô' => 0x8C,
        'ì' => 0x8D,
        'Ã' => 0x8E,
        'Â' => 0x8F,
        'É' => 0x90,
        'À' => 0x91,
        'È' => 0x92,
        'ô' => 0x93,
        'õ' => 0x94,
        'ò' => 0x95,
        'Ú' => 0x96,
        'ù' => 0x97,
        'Ì' => 0x98,
        'Õ' => 0x99,
        'Ü' => 0x9A,
        '¢' => 0x9B,
        '£' => 0x9C,
        'Ù' => 0x9D,
        'Ó' => 0x9F,
        'á' => 0xA0,
        'í' => 0xA1,
        'ó' => 0xA2,
        'ú' => 0xA3,
        'ñ' => 0xA4,
        'Ñ' => 0xA5,
        'ª' => 0xA6,
        'º' => 0xA7,
        '¿' => 0xA8,
        'Ò' => 0xA9,
        '°' => 0xF8,
        _ => return None,
    };
    Some(byte)
}
