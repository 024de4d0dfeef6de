//! Token data structures and post-processing
//!
//! A `Token` is a little bit-field builder: a primary byte with packed
//! fields followed by operand bytes. The `TokenStream` collects tokens,
//! sections, labels and variable declarations; the `TokenAnalyser` lays out
//! variables, resolves jumps (widening short branches to fixpoint) and
//! computes the download header with its CRC.

use edc_core::diag::{DiagSink, Kind};
use edc_core::program::StageError;
use indexmap::IndexMap;

pub const MIN_BYTE: i64 = 0;
pub const MAX_BYTE: i64 = 0xff;
pub const MIN_WORD: i64 = -0x7fff;
pub const MAX_WORD: i64 = 0x7fff;
pub const MAX_UWORD: i64 = 0xffff;
pub const MIN_SBYTE: i64 = -0x7f;
pub const MAX_SBYTE: i64 = 0x7f;

pub const SPACE_BYTE: usize = 0;
pub const SPACE_WORD: usize = 1;
pub const SPACE_LCD: usize = 2;

pub const SPACE_NAMES: [&str; 3] = ["Byte", "Word", "LCD"];
pub const LIMIT_NAMES: [&str; 5] = ["Bytes", "Words", "LCD chars", "Event handlers", "Token bytes"];
/// No LCD on this hardware, so that limit is 0.
pub const MAX_LIMITS: [i64; 5] = [256, 256, 0, 16, 4096];

/// Report an internal assembler error and fail the stage.
pub fn asm_error(diag: &mut DiagSink, number: u32, detail: &str) -> StageError {
    if !detail.is_empty() {
        diag.error_raw(detail);
    }
    diag.error(Kind::AsmInternalError, &[&number]);
    StageError::Assemble
}

/// The firmware mis-computes the CRC when the image length is 254 plus a
/// multiple of 256; those lengths get one pad byte appended.
pub fn is_bad_length_for_crc(data_len: usize) -> bool {
    data_len >= 254 && (data_len - 254) % 256 == 0
}

/// CRC-16, polynomial 0x1021, initial value 0xFFFF, MSB-first, no final xor.
pub fn calculate_crc(bytes: &[u8]) -> u16 {
    let mut crc: u32 = 0xffff;
    for b in bytes {
        crc ^= (*b as u32) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    (crc & 0xffff) as u16
}

pub fn word_to_bytes(word: i64) -> (u8, u8) {
    let w = (word & 0xffff) as u16;
    ((w >> 8) as u8, (w & 0xff) as u8)
}

/// What kind of token this is; gates which section it may appear in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Move,
    Data,
    UniMath,
    BasicMath,
    LogMath,
    Conv,
    Stack,
    Output,
    Jump,
    Misc,
    Event,
    Binary,
    Comms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Main,
    Event,
    Firmware,
}

impl Section {
    pub fn name(&self) -> &'static str {
        match self {
            Section::Main => "main",
            Section::Event => "event",
            Section::Firmware => "firmware",
        }
    }
}

/// A jump reference: operand index, target label, long form?
#[derive(Debug, Clone)]
pub struct JumpLabel {
    pub index: usize,
    pub name: String,
    pub big: bool,
}

#[derive(Debug, Clone)]
pub struct Token {
    kind: TokenKind,
    /// (byte index, shift, mask, value) applied in insertion order
    token_info: Vec<(usize, u32, u32, u32)>,
    /// (byte index, space, variable name) — the variable's resolved address
    /// is added to the byte at that index
    pub var_info: Vec<(usize, usize, String)>,
    jump_label: Option<JumpLabel>,
    /// Pass-through bytes (INSERT BINARY / BINB payloads)
    binary: Option<Vec<u8>>,
    cached_bits: Vec<u8>,
}

impl Token {
    pub fn new(kind: TokenKind) -> Self {
        Token {
            kind,
            token_info: Vec::new(),
            var_info: Vec::new(),
            jump_label: None,
            binary: None,
            cached_bits: Vec::new(),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    fn invalidate_cache(&mut self) {
        self.cached_bits.clear();
    }

    pub fn add_byte(&mut self, index: usize, value: i64, diag: &mut DiagSink) -> Result<(), StageError> {
        if !(MIN_BYTE..=MAX_BYTE).contains(&value) {
            return Err(asm_error(diag, 130, &format!("Out of range for a byte: {}", value)));
        }
        self.token_info.push((index, 0, 0xff, value as u32));
        self.invalidate_cache();
        Ok(())
    }

    pub fn add_word(&mut self, index: usize, value: i64, diag: &mut DiagSink) -> Result<(), StageError> {
        if !(MIN_WORD..=MAX_WORD).contains(&value) {
            return Err(asm_error(diag, 136, &format!("Out of range for a word: {}", value)));
        }
        self.push_word_bytes(index, value);
        Ok(())
    }

    pub fn add_uword(&mut self, index: usize, value: i64, diag: &mut DiagSink) -> Result<(), StageError> {
        if !(0..=MAX_UWORD).contains(&value) {
            return Err(asm_error(
                diag,
                137,
                &format!("Out of range for an unsigned word: {}", value),
            ));
        }
        self.push_word_bytes(index, value);
        Ok(())
    }

    fn push_word_bytes(&mut self, index: usize, value: i64) {
        self.token_info.push((index, 0, 0xff, ((value >> 8) & 0xff) as u32));
        self.token_info.push((index + 1, 0, 0xff, (value & 0xff) as u32));
        self.invalidate_cache();
    }

    pub fn add_bits(&mut self, index: usize, shift: u32, mask: u32, value: u32) {
        self.token_info.push((index, shift, mask, value));
        self.invalidate_cache();
    }

    /// Reference a variable: its address is added to the byte at `index`.
    pub fn add_vname(&mut self, index: usize, space: usize, name: &str) {
        self.var_info.push((index, space, name.to_string()));
        self.invalidate_cache();
    }

    pub fn add_binary(&mut self, bytes: Vec<u8>) {
        self.binary = Some(bytes);
        self.invalidate_cache();
    }

    pub fn set_jump_label(&mut self, index: usize, name: &str, big: bool) {
        self.jump_label = Some(JumpLabel {
            index,
            name: name.to_string(),
            big,
        });
        self.invalidate_cache();
    }

    pub fn jump_label(&self) -> Option<&JumpLabel> {
        self.jump_label.as_ref()
    }

    pub fn rename_jump_label(&mut self, name: String) {
        if let Some(j) = self.jump_label.as_mut() {
            j.name = name;
        }
    }

    fn find_index(&self, index: usize, diag: &mut DiagSink) -> Result<usize, StageError> {
        self.token_info
            .iter()
            .position(|e| e.0 == index)
            .ok_or_else(|| asm_error(diag, 131, &format!("Variable index: {} invalid", index)))
    }

    /// Add a resolved variable address into the byte at `index`.
    pub fn fixup_var_byte(&mut self, index: usize, value: i64, diag: &mut DiagSink) -> Result<(), StageError> {
        let i = self.find_index(index, diag)?;
        let new_number = self.token_info[i].3 as i64 + value;
        if !(MIN_BYTE..=MAX_BYTE).contains(&new_number) {
            return Err(asm_error(diag, 134, &format!("Out of range for a byte: {}", new_number)));
        }
        self.token_info[i] = (index, 0, 0xff, new_number as u32);
        self.invalidate_cache();
        Ok(())
    }

    /// Rewrite the jump operand with a resolved offset, widening to the long
    /// form when asked. Widening is monotonic; shrinking is impossible.
    pub fn fixup_jump(&mut self, big: bool, offset: i64, diag: &mut DiagSink) -> Result<(), StageError> {
        let JumpLabel { index, name, big: was_big } = match &self.jump_label {
            Some(j) => j.clone(),
            None => return Err(asm_error(diag, 138, "fixup_jump on a token with no jump label")),
        };

        if big != was_big {
            if !big {
                return Err(asm_error(diag, 135, "Impossible - the jump size got SMALLER"));
            }
            let i = self.find_index(index, diag)?;
            self.token_info.remove(i);
            self.add_bits(0, 4, 1, 1);
            self.add_word(index, offset, diag)?;
            self.jump_label = Some(JumpLabel { index, name, big });
        } else if big {
            let i = self.find_index(index, diag)?;
            self.token_info.remove(i);
            let i = self.find_index(index + 1, diag)?;
            self.token_info.remove(i);
            self.add_word(index, offset, diag)?;
        } else {
            let i = self.find_index(index, diag)?;
            self.token_info.remove(i);
            let mut offset = offset;
            if offset < 0 {
                offset += 256;
            }
            self.add_byte(index, offset, diag)?;
        }
        self.invalidate_cache();
        Ok(())
    }

    pub fn byte_len(&mut self) -> usize {
        self.bits().len()
    }

    /// Assemble (and cache) the token's bytes.
    pub fn bits(&mut self) -> &[u8] {
        if self.cached_bits.is_empty() {
            if let Some(binary) = &self.binary {
                self.cached_bits = binary.clone();
            } else {
                let mut bits = vec![0u8];
                for (index, shift, mask, value) in &self.token_info {
                    while bits.len() < index + 1 {
                        bits.push(0);
                    }
                    let mut work = bits[*index] as u32;
                    work &= !(mask << shift);
                    work |= (value & mask) << shift;
                    bits[*index] = work as u8;
                }
                self.cached_bits = bits;
            }
        }
        &self.cached_bits
    }
}

/// A variable or reservation request in one memory space.
#[derive(Debug, Clone)]
pub struct SpaceEntry {
    pub reserved: bool,
    pub name: String,
    /// negative means "float" (layout will place it)
    pub start: i64,
    pub length: i64,
}

#[derive(Debug, Default)]
pub struct TokenStream {
    pub tokens: Vec<Token>,
    pub limits: Vec<i64>,
    pub name_space: [Vec<SpaceEntry>; 3],
    /// location -> (type code, size)
    pub devices: IndexMap<u8, (u8, u8)>,
    /// label -> stream index it marks
    pub labels: IndexMap<String, usize>,
    current_sections: Vec<Section>,
    /// (section, first token index, one-past-last token index or -1)
    pub section_breaks: Vec<(Section, usize, i64)>,
    /// the BEGIN EVENT arguments: (modreg, mask, value)
    pub section_args: Vec<(i64, i64, i64)>,
    pub section_count: usize,
    pub version: Option<(u8, u8)>,
    pub download_type: Vec<Section>,
}

impl TokenStream {
    pub fn new() -> Self {
        TokenStream {
            limits: MAX_LIMITS.to_vec(),
            ..Default::default()
        }
    }

    pub fn stream_marker(&self) -> usize {
        self.tokens.len()
    }

    pub fn add_token(&mut self, mut token: Token, diag: &mut DiagSink) -> Result<(), StageError> {
        match token.kind() {
            TokenKind::Data => {
                if !matches!(self.current_sections.last(), Some(Section::Main | Section::Event)) {
                    return Err(asm_error(diag, 101, "DATA must be in a 'main' or 'event' section."));
                }
            }
            TokenKind::Binary => {
                if !matches!(self.current_sections.last(), Some(Section::Firmware)) {
                    return Err(asm_error(diag, 102, "INSERT BINARY must be in a 'firmware' section."));
                }
            }
            _ => {
                if !matches!(self.current_sections.last(), Some(Section::Main | Section::Event)) {
                    return Err(asm_error(diag, 103, "Tokens must be in a 'main' or 'event' section."));
                }
            }
        }

        // Jump labels are scoped to their section unless global (still
        // starting with ':' after the lexer stripped one).
        if let Some(jump) = token.jump_label() {
            if !jump.name.starts_with(':') {
                let scoped = format!("{}_{}", jump.name, self.section_count);
                token.rename_jump_label(scoped);
            }
        }

        self.tokens.push(token);
        Ok(())
    }

    pub fn add_label(&mut self, name: &str, diag: &mut DiagSink) -> Result<(), StageError> {
        if !matches!(self.current_sections.last(), Some(Section::Main | Section::Event)) {
            return Err(asm_error(diag, 106, "Labels must be in a 'main' or 'event' section."));
        }

        let new_name = if name.starts_with(':') {
            name.to_string()
        } else {
            format!("{}_{}", name, self.section_count)
        };

        if self.labels.contains_key(&new_name) {
            return Err(asm_error(
                diag,
                107,
                &format!("Label {} defined twice in the same section.", name),
            ));
        }
        self.labels.insert(new_name, self.stream_marker());
        Ok(())
    }

    pub fn set_limits(
        &mut self,
        limits: [i64; 5],
        diag: &mut DiagSink,
    ) -> Result<(), StageError> {
        if self.section_count > 0 {
            return Err(asm_error(diag, 108, "LIMITS must be before all sections."));
        }
        for i in 0..5 {
            if limits[i] < 0 {
                return Err(asm_error(
                    diag,
                    109,
                    &format!("Limit {} can't be less then 0.", LIMIT_NAMES[i]),
                ));
            }
            if limits[i] > MAX_LIMITS[i] {
                return Err(asm_error(diag, 110, &format!("Limit {} too large.", LIMIT_NAMES[i])));
            }
        }
        self.limits = limits.to_vec();
        Ok(())
    }

    pub fn reserve_name_space(
        &mut self,
        space: usize,
        start: i64,
        length: i64,
        diag: &mut DiagSink,
    ) -> Result<(), StageError> {
        if self.section_count > 0 {
            return Err(asm_error(diag, 112, "RESERV must be before all sections."));
        }
        if start < 0 || length <= 0 {
            return Err(asm_error(diag, 113, "Negative start or length is not allowed"));
        }
        if start + length > self.limits[space] {
            diag.error_raw(&format!(
                "Reserve space extends beyond the max for {} space.",
                SPACE_NAMES[space]
            ));
            diag.error(Kind::AsmMemOverflow, &[&SPACE_NAMES[space]]);
            return Err(StageError::Assemble);
        }
        self.name_space[space].push(SpaceEntry {
            reserved: true,
            name: String::new(),
            start,
            length,
        });
        Ok(())
    }

    pub fn add_variable(
        &mut self,
        space: usize,
        name: &str,
        start: i64,
        length: i64,
        diag: &mut DiagSink,
    ) -> Result<(), StageError> {
        if length < 0 {
            return Err(asm_error(diag, 114, "Negative length of data is not allowed"));
        }
        let name = if name == "*" { "" } else { name };
        self.name_space[space].push(SpaceEntry {
            reserved: false,
            name: name.to_string(),
            start,
            length,
        });
        Ok(())
    }

    pub fn add_device(&mut self, type_code: u8, location: u8, size: u8, diag: &mut DiagSink) -> Result<(), StageError> {
        if self.section_count > 0 {
            return Err(asm_error(diag, 115, "DEVICE must be before all sections."));
        }
        self.devices.insert(location, (type_code, size));
        Ok(())
    }

    pub fn add_version(&mut self, major: u8, minor: u8, diag: &mut DiagSink) -> Result<(), StageError> {
        if self.section_count > 0 {
            return Err(asm_error(diag, 116, "VERSION must be before all sections."));
        }
        self.version = Some((major, minor));
        Ok(())
    }

    pub fn add_begin(
        &mut self,
        section: Section,
        args: (i64, i64, i64),
        diag: &mut DiagSink,
    ) -> Result<(), StageError> {
        if !self.current_sections.is_empty() {
            return Err(asm_error(
                diag,
                117,
                &format!("This section {} must be the first section", section.name()),
            ));
        }
        if !self.download_type.is_empty() {
            let first = self.download_type[0];
            if matches!(first, Section::Main | Section::Event) && section == Section::Firmware {
                return Err(asm_error(diag, 118, "Can't mix 'firmware' and 'main'/'event' sections"));
            }
            if first == Section::Firmware {
                return Err(asm_error(
                    diag,
                    119,
                    "Can't mix 'firmware' and 'main'/'event' sections or have multiple 'firmware' sections",
                ));
            }
            if section == Section::Main && self.download_type.contains(&Section::Main) {
                return Err(asm_error(diag, 120, "Can't have multiple 'main' sections"));
            }
        }
        self.download_type.push(section);
        self.current_sections.push(section);
        self.section_breaks.push((section, self.stream_marker(), -1));
        self.section_args.push(args);
        self.section_count += 1;
        Ok(())
    }

    pub fn add_end(&mut self, section: Section, diag: &mut DiagSink) -> Result<(), StageError> {
        let pos = match self.current_sections.iter().position(|s| *s == section) {
            Some(p) => p,
            None => {
                return Err(asm_error(
                    diag,
                    121,
                    &format!("Not in section {}, so can't end it", section.name()),
                ));
            }
        };
        let marker = self.stream_marker();
        for brk in self.section_breaks.iter_mut() {
            if brk.0 == section && brk.2 < 0 {
                brk.2 = marker as i64;
                break;
            }
        }
        self.current_sections.remove(pos);
        Ok(())
    }

    pub fn in_open_section(&self) -> bool {
        !self.current_sections.is_empty()
    }

    /// Dump all tokens (the assembly-debug output).
    pub fn dump_tokens(&mut self) {
        println!("Dumping tokens\n");
        let labels = self.labels.clone();
        let breaks = self.section_breaks.clone();
        for i in 0..self.tokens.len() {
            for (section, start, _) in &breaks {
                if *start == i {
                    println!(" ****** SECTION START {} *****\n", section.name());
                }
            }
            for (name, at) in &labels {
                if *at == i {
                    println!(":{}", name);
                }
            }
            let bits = self.tokens[i].bits().to_vec();
            print!("{:3}: ", i);
            for b in &bits {
                print!("{:02x} ", b);
            }
            println!();
        }
    }
}

/// The type of image the stream assembles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadType {
    Program,
    Firmware,
}

/// Post-processing over a finished stream: variable layout, jump
/// resolution, header creation.
pub struct TokenAnalyser {
    pub stream: TokenStream,
    pub name_space_map: [IndexMap<String, (i64, i64)>; 3],
    pub name_space_max: [i64; 3],
}

impl TokenAnalyser {
    pub fn new(stream: TokenStream) -> Self {
        TokenAnalyser {
            stream,
            name_space_map: Default::default(),
            name_space_max: [0, 0, 0],
        }
    }

    /// Lay out every space and patch variable references into the tokens.
    pub fn map_all_variables(&mut self, diag: &mut DiagSink) -> Result<(), StageError> {
        diag.set_error_context(2, "Mapping all variables");
        for space in 0..3 {
            self.map_variables_in_space(space, diag)?;
        }

        diag.set_error_context(2, "Fixing up variable references");
        for t in &mut self.stream.tokens {
            for (index, space, name) in t.var_info.clone() {
                let addr = match self.name_space_map[space].get(&name) {
                    Some((start, _)) => *start,
                    None => {
                        return Err(asm_error(
                            diag,
                            122,
                            &format!("Variable {} not declared in {} space.", name, SPACE_NAMES[space]),
                        ));
                    }
                };
                t.fixup_var_byte(index, addr, diag)?;
            }
        }
        Ok(())
    }

    /// Fixed and reserved entries placed first (overlap is an error), then
    /// floats by best-fit, longest first.
    fn map_variables_in_space(&mut self, space: usize, diag: &mut DiagSink) -> Result<(), StageError> {
        diag.set_error_context(2, &format!("Mapping variables in {} space", SPACE_NAMES[space]));
        let limit = self.stream.limits[space];
        let variables = self.stream.name_space[space].clone();
        let v_map = &mut self.name_space_map[space];
        v_map.clear();

        // (start, length, end) free regions
        let mut free: Vec<(i64, i64, i64)> = vec![(0, limit, limit)];

        for entry in variables.iter().filter(|e| e.reserved || e.start >= 0) {
            let start = entry.start;
            let end = start + entry.length;

            if !entry.reserved {
                if let Some((have_start, have_len)) = v_map.get(&entry.name) {
                    if *have_start != start || *have_len != entry.length {
                        return Err(asm_error(
                            diag,
                            123,
                            &format!("Data variable {} declared twice and differently!", entry.name),
                        ));
                    }
                    // identical re-declaration, already placed
                    continue;
                }
            }

            let slot = free
                .iter()
                .position(|(f_start, _, f_end)| start >= *f_start && start < *f_end)
                .filter(|i| end <= free[*i].2);
            let slot = match slot {
                Some(i) => i,
                None => {
                    if !entry.reserved {
                        diag.error_raw(&format!(
                            "Fixed data variable {} at {} didn't fit!",
                            entry.name, start
                        ));
                        diag.error(Kind::AsmMemOverflow, &[&"fixed"]);
                    } else {
                        diag.error_raw(&format!("No room for Reserved data space at {}", start));
                        diag.error(Kind::AsmMemOverflow, &[&"rsvd"]);
                    }
                    return Err(StageError::Assemble);
                }
            };

            if !entry.reserved {
                v_map.insert(entry.name.clone(), (start, entry.length));
            }

            let (f_start, f_length, f_end) = free.remove(slot);
            if start == f_start {
                if end != f_end {
                    free.insert(slot, (end, f_length - entry.length, f_end));
                }
            } else if end == f_end {
                free.insert(slot, (f_start, f_length - entry.length, start));
            } else {
                free.insert(slot, (f_start, start - f_start, start));
                free.insert(slot + 1, (end, f_end - end, f_end));
            }
        }

        // Floating variables: longest first, best (smallest fitting) hole.
        let mut floats: Vec<(String, i64)> = variables
            .iter()
            .filter(|e| !e.reserved && e.start < 0)
            .map(|e| (e.name.clone(), e.length))
            .collect();
        floats.sort_by(|a, b| b.1.cmp(&a.1));

        for (name, length) in floats {
            let mut best_index: Option<usize> = None;
            for (i, (_, f_length, _)) in free.iter().enumerate() {
                if *f_length >= length {
                    match best_index {
                        None => best_index = Some(i),
                        Some(b) if *f_length < free[b].1 => best_index = Some(i),
                        _ => {}
                    }
                    if *f_length == length {
                        best_index = Some(i);
                        break;
                    }
                }
            }

            let best = match best_index {
                Some(b) => b,
                None => {
                    return Err(asm_error(
                        diag,
                        124,
                        &format!("Float data variable {} (len:{}) didn't fit!", name, length),
                    ));
                }
            };

            let (f_start, f_length, f_end) = free[best];
            if v_map.contains_key(&name) {
                return Err(asm_error(diag, 125, &format!("Data variable {} declared twice!", name)));
            }
            v_map.insert(name, (f_start, length));

            if length == f_length {
                free.remove(best);
            } else {
                free[best] = (f_start + length, f_length - length, f_end);
            }
        }

        let mut max = 0;
        for (start, length) in v_map.values() {
            max = max.max(start + length);
        }
        self.name_space_max[space] = max;
        Ok(())
    }

    /// Cumulative byte length before each token (plus one final total).
    fn cumulative_lengths(&mut self) -> Vec<i64> {
        let mut lengths = Vec::with_capacity(self.stream.tokens.len() + 1);
        let mut total = 0i64;
        for t in &mut self.stream.tokens {
            lengths.push(total);
            total += t.byte_len() as i64;
        }
        lengths.push(total);
        lengths
    }

    /// Resolve every jump; widen branches that do not fit the short form
    /// and re-run until fixpoint (widening only grows, so this terminates).
    pub fn fixup_jumps(&mut self, diag: &mut DiagSink) -> Result<(), StageError> {
        diag.set_error_context(2, "Fixing up jumps");

        for t in &self.stream.tokens {
            if let Some(jump) = t.jump_label() {
                if !self.stream.labels.contains_key(&jump.name) {
                    return Err(asm_error(
                        diag,
                        126,
                        &format!("Reference to an unknown label:{}", jump.name),
                    ));
                }
            }
        }

        loop {
            let c_lengths = self.cumulative_lengths();
            let mut widened_at = None;

            for i in 0..self.stream.tokens.len() {
                let (name, big, _index) = match self.stream.tokens[i].jump_label() {
                    Some(j) => (j.name.clone(), j.big, j.index),
                    None => continue,
                };
                // The PC points at the start of the next token.
                let my_address = c_lengths[i + 1];
                let target_address = c_lengths[self.stream.labels[&name]];
                let offset = target_address - my_address;

                if !big {
                    if !(MIN_SBYTE..=MAX_SBYTE).contains(&offset) {
                        self.stream.tokens[i].fixup_jump(true, offset, diag)?;
                        widened_at = Some(i);
                        break;
                    }
                    self.stream.tokens[i].fixup_jump(false, offset, diag)?;
                } else {
                    self.stream.tokens[i].fixup_jump(true, offset, diag)?;
                }
            }

            if widened_at.is_none() {
                return Ok(());
            }
        }
    }

    /// Build the download header. Program images get
    /// `len, crc, byte-max, word-max, main-offset, event table, 0x0000`;
    /// firmware images get `len, crc` only.
    pub fn create_header(&mut self, diag: &mut DiagSink) -> Result<(DownloadType, (u8, u8), Vec<u8>, usize), StageError> {
        diag.set_error_context(2, "Creating download header");
        let version = match self.stream.version {
            Some(v) => v,
            None => return Err(asm_error(diag, 127, "Version wasn't set")),
        };
        let download_type = match self.stream.download_type.first() {
            Some(Section::Firmware) => DownloadType::Firmware,
            Some(_) => DownloadType::Program,
            None => return Err(asm_error(diag, 139, "No sections were assembled")),
        };

        match download_type {
            DownloadType::Firmware => {
                if version.0 != 0xe && version.0 != 0x2 {
                    return Err(asm_error(
                        diag,
                        128,
                        &format!(
                            "This assembler only handles firmware major versions 0xe or 0x2 (not 0x{:x})",
                            version.0
                        ),
                    ));
                }
            }
            DownloadType::Program => {
                if version.0 != 0x6 {
                    return Err(asm_error(
                        diag,
                        129,
                        &format!("This assembler only handles token major versions 0x6 (not 0x{:x})", version.0),
                    ));
                }
            }
        }

        let mut bytes: Vec<u8> = Vec::new();
        for t in &mut self.stream.tokens {
            bytes.extend_from_slice(t.bits());
        }

        let mut added_bytes = 0usize;
        if download_type == DownloadType::Firmware {
            if is_bad_length_for_crc(bytes.len()) {
                diag.debug_raw(&format!("skipping bad CRC length at {} bytes", bytes.len()));
                added_bytes = 1;
                bytes.push(0xff);
            }
            let mut header = vec![0u8; 4];
            let (hi, lo) = word_to_bytes(bytes.len() as i64);
            header[0] = hi;
            header[1] = lo;
            let (hi, lo) = word_to_bytes(calculate_crc(&bytes) as i64);
            header[2] = hi;
            header[3] = lo;
            return Ok((DownloadType::Firmware, version, header, added_bytes));
        }

        // len(2), crc(2), 8-bit vars, 16-bit vars, main offset(2)
        let mut header = vec![0u8; 8];
        header[4] = self.name_space_max[SPACE_BYTE] as u8;
        header[5] = self.name_space_max[SPACE_WORD] as u8;

        let c_lengths = self.cumulative_lengths();
        let mut main_offset = 0i64;
        let mut event_list: Vec<(i64, i64, i64, i64)> = Vec::new();
        for (i, (section, start_token, _)) in self.stream.section_breaks.iter().enumerate() {
            if *section == Section::Main {
                main_offset = c_lengths[*start_token];
            } else if *section == Section::Event {
                let (modreg, mask, value) = self.stream.section_args[i];
                event_list.push((c_lengths[*start_token], modreg, mask, value));
            }
        }

        let final_header_bytes = (header.len() + event_list.len() * 5 + 2) as i64;

        let (hi, lo) = word_to_bytes(main_offset + final_header_bytes);
        header[6] = hi;
        header[7] = lo;

        for (offset, modreg, mask, value) in &event_list {
            let (hi, lo) = word_to_bytes(offset + final_header_bytes);
            header.push(hi);
            header.push(lo);
            header.push(*modreg as u8);
            header.push(*mask as u8);
            header.push(*value as u8);
        }
        header.push(0);
        header.push(0);

        // Length and CRC cover everything after themselves.
        let mut crc_span: Vec<u8> = header[4..].to_vec();
        crc_span.extend_from_slice(&bytes);
        if is_bad_length_for_crc(crc_span.len()) {
            diag.debug_raw(&format!("skipping bad CRC length at {} bytes", crc_span.len()));
            added_bytes += 1;
            crc_span.push(0xff);
        }
        let (hi, lo) = word_to_bytes(crc_span.len() as i64);
        header[0] = hi;
        header[1] = lo;
        let (hi, lo) = word_to_bytes(calculate_crc(&crc_span) as i64);
        header[2] = hi;
        header[3] = lo;

        Ok((DownloadType::Program, version, header, added_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag() -> DiagSink {
        let mut d = DiagSink::new();
        d.set_max_level(edc_core::diag::Level::Error);
        d
    }

    #[test]
    fn crc_known_values() {
        // CCITT-FALSE reference value for "123456789"
        assert_eq!(calculate_crc(b"123456789"), 0x29b1);
        assert_eq!(calculate_crc(&[]), 0xffff);
    }

    #[test]
    fn bad_crc_lengths() {
        assert!(is_bad_length_for_crc(254));
        assert!(!is_bad_length_for_crc(255));
        assert!(!is_bad_length_for_crc(509));
        assert!(is_bad_length_for_crc(510));
        assert!(is_bad_length_for_crc(766));
        assert!(!is_bad_length_for_crc(10));
    }

    #[test]
    fn token_bit_packing() {
        let mut d = diag();
        let mut t = Token::new(TokenKind::Move);
        t.add_bits(0, 6, 3, 1);
        t.add_bits(0, 2, 0xf, 0xa);
        t.add_byte(1, 0x42, &mut d).unwrap();
        assert_eq!(t.bits(), &[0x68, 0x42]);
    }

    #[test]
    fn word_is_big_endian() {
        let mut d = diag();
        let mut t = Token::new(TokenKind::Data);
        t.add_byte(0, 0x21, &mut d).unwrap();
        t.add_word(1, -2, &mut d).unwrap();
        assert_eq!(t.bits(), &[0x21, 0xff, 0xfe]);
    }

    #[test]
    fn byte_range_is_enforced() {
        let mut d = diag();
        let mut t = Token::new(TokenKind::Misc);
        assert!(t.add_byte(0, 300, &mut d).is_err());
        assert!(t.add_word(0, 0x8000, &mut d).is_err());
        assert!(t.add_uword(0, 0x8000, &mut d).is_ok());
    }

    #[test]
    fn layout_fixed_then_best_fit() {
        let mut d = diag();
        let mut stream = TokenStream::new();
        stream.add_version(6, 0, &mut d).unwrap();
        stream.reserve_name_space(SPACE_BYTE, 0, 4, &mut d).unwrap();
        stream.add_variable(SPACE_BYTE, "fixed", 10, 4, &mut d).unwrap();
        stream.add_variable(SPACE_BYTE, "big", -1, 6, &mut d).unwrap();
        stream.add_variable(SPACE_BYTE, "small", -1, 2, &mut d).unwrap();

        let mut analysis = TokenAnalyser::new(stream);
        analysis.map_all_variables(&mut d).unwrap();

        let map = &analysis.name_space_map[SPACE_BYTE];
        assert_eq!(map["fixed"], (10, 4));
        // "big" is placed first (longest) and exactly fits the 4..10 hole
        assert_eq!(map["big"], (4, 6));
        // "small" goes into the remaining open region
        assert_eq!(map["small"], (14, 2));
        assert_eq!(analysis.name_space_max[SPACE_BYTE], 16);
    }

    #[test]
    fn layout_overlap_is_an_error() {
        let mut d = diag();
        let mut stream = TokenStream::new();
        stream.add_variable(SPACE_WORD, "a", 0, 4, &mut d).unwrap();
        stream.add_variable(SPACE_WORD, "b", 2, 4, &mut d).unwrap();
        let mut analysis = TokenAnalyser::new(stream);
        assert!(analysis.map_all_variables(&mut d).is_err());
        assert!(d.was_error_raised());
    }

    #[test]
    fn float_overflow_is_reported() {
        let mut d = diag();
        let mut stream = TokenStream::new();
        stream.set_limits([8, 8, 0, 16, 4096], &mut d).unwrap();
        stream.add_variable(SPACE_BYTE, "too-big", -1, 9, &mut d).unwrap();
        let mut analysis = TokenAnalyser::new(stream);
        assert!(analysis.map_all_variables(&mut d).is_err());
    }

    #[test]
    fn firmware_header_is_len_and_crc_only() {
        let mut d = diag();
        let mut stream = TokenStream::new();
        stream.add_version(0xe, 0, &mut d).unwrap();
        stream.add_begin(Section::Firmware, (-1, -1, -1), &mut d).unwrap();
        let mut t = Token::new(TokenKind::Binary);
        t.add_binary(vec![1, 2, 3]);
        stream.add_token(t, &mut d).unwrap();
        stream.add_end(Section::Firmware, &mut d).unwrap();

        let mut analysis = TokenAnalyser::new(stream);
        analysis.map_all_variables(&mut d).unwrap();
        analysis.fixup_jumps(&mut d).unwrap();
        let (kind, version, header, added) = analysis.create_header(&mut d).unwrap();
        assert_eq!(kind, DownloadType::Firmware);
        assert_eq!(version, (0xe, 0));
        assert_eq!(added, 0);
        assert_eq!(&header[0..2], &[0, 3]);
        let crc = calculate_crc(&[1, 2, 3]);
        assert_eq!(&header[2..4], &[(crc >> 8) as u8, (crc & 0xff) as u8]);
    }
}
