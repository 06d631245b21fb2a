use std::iter::repeat;

use eyre::{Context, Result as EyreResult};
use image::GrayImage;
use tracing::debug;

use crate::error::{KnittyError, Result};
use crate::{util, Nibble};

/// Number of 7-byte slots in the header table.
const PATTERN_COUNT: usize = 98;

/// Largest number of *live* patterns a header table can hold: one slot's
/// worth of space is always reserved for the 5-zero + next-free-number
/// trailer that follows the last live header (see `serialize_header_table`).
const MAX_PATTERNS: usize = PATTERN_COUNT - 1;

const CONTROL_BLOCK_SIZE: usize = 23;
const HEADER_TABLE_LEN: usize = 686;

const DATA0_LEN: usize = 32;
const DATA1_LEN: usize = 211;
const DATA2_LEN: usize = 20;

const IMAGE_SIZE: usize = 32768;
const PATTERN_DATA_START: u16 = 0x0120;

/// One knitting pattern: its stitch grid, the metadata the machine stores
/// next to it, and nothing interpreted beyond that.
pub struct Pattern {
    number: u16,
    rows: Vec<Vec<bool>>,
    height: u16,
    width: u16,
    memo: Vec<u8>,
}

/// Fixed 23-byte record of pointers into the pattern-data region.
///
/// The four `unknown*` fields have no known meaning; they are carried
/// verbatim on every round-trip and never interpreted.
#[derive(Default, Debug, Clone)]
pub struct ControlBlock {
    pub next_pattern_ptr1: u16,
    pub unknown1: u16,
    pub next_pattern_ptr2: u16,
    pub last_pattern_end_ptr: u16,
    pub unknown2: u16,
    pub last_pattern_start_ptr: u16,
    pub unknown3: u32,
    pub header_end_ptr: u16,
    pub unknown_ptr: u16,
    pub unknown4_1: u16,
    pub unknown4_2: u8,
}

/// The logical content of the 32 KiB KH-940 RAM dump.
pub struct MachineState {
    patterns: Vec<Pattern>,
    data0: Vec<u8>,
    control: ControlBlock,
    data1: Vec<u8>,
    loaded_pattern: u16,
    data2: Vec<u8>,
}

impl MachineState {
    /// A freshly formatted machine: no patterns, all opaque regions zeroed.
    pub fn empty() -> Self {
        MachineState {
            patterns: Vec::new(),
            data0: vec![0; DATA0_LEN],
            control: ControlBlock::default(),
            data1: vec![0; DATA1_LEN],
            loaded_pattern: 0,
            data2: vec![0; DATA2_LEN],
        }
    }

    pub fn from_memory_dump(data: &[u8]) -> Result<Self> {
        if data.len() != IMAGE_SIZE {
            return Err(KnittyError::WrongSize {
                what: "memory image",
                expected: IMAGE_SIZE,
                got: data.len(),
            });
        }

        let mut patterns = Vec::new();

        for i in 0..PATTERN_COUNT {
            if let Some(pattern) = Pattern::from_memory_dump(data, i) {
                patterns.push(pattern);
            }
        }

        let data0 = data[0x7ee0..0x7f00].to_vec();
        let control = ControlBlock::from_bytes(&data[0x7f00..0x7f17]);

        debug!(?control, "Control block parsed");

        let data1 = data[0x7f17..0x7fea].to_vec();
        let loaded_pattern = util::from_bcd(&util::to_nibbles(&data[0x7fea..0x7fec])[1..]);
        let data2 = data[0x7fec..0x8000].to_vec();

        Ok(MachineState {
            patterns,
            data0,
            control,
            data1,
            loaded_pattern,
            data2,
        })
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn loaded_pattern(&self) -> u16 {
        self.loaded_pattern
    }

    pub fn set_loaded_pattern(&mut self, pattern: u16) {
        self.loaded_pattern = pattern;
    }

    /// Insert a pattern, replacing any existing pattern with the same number.
    ///
    /// Fails if the machine already holds `PATTERN_COUNT` distinct patterns
    /// and `pattern` would add a new one rather than replace an existing one.
    pub fn add_pattern(&mut self, pattern: Pattern) -> Result<()> {
        let replaces_existing = self.patterns.iter().any(|p| p.number == pattern.number);
        if !replaces_existing && self.patterns.len() >= MAX_PATTERNS {
            return Err(KnittyError::TooManyPatterns(
                self.patterns.len() + 1,
                MAX_PATTERNS,
            ));
        }

        self.patterns.retain(|p| p.number != pattern.number);
        self.patterns.push(pattern);
        self.patterns.sort_unstable_by_key(|p| p.number);

        Ok(())
    }

    pub fn serialize(&mut self) -> Vec<u8> {
        let pattern_layout = {
            let mut offset = PATTERN_DATA_START;
            let mut layout = Vec::with_capacity(self.patterns.len());

            for pattern in &self.patterns {
                let data = pattern.serialize_data();
                let data_len = data.len() as u16;
                layout.push((offset, pattern, data));
                offset += data_len;
            }

            layout
        };

        self.control.update(&pattern_layout);

        let header_table = serialize_header_table(&pattern_layout);
        let pattern_mem_pad = serialize_pattern_memory_padding(&pattern_layout);
        let pattern_mem = serialize_pattern_memory(&pattern_layout);
        let control = self.control.serialize();
        let loaded_pattern = serialize_loaded_pattern(self.loaded_pattern);

        let mut data = Vec::with_capacity(IMAGE_SIZE);

        data.extend(header_table);
        data.extend(pattern_mem_pad);
        data.extend(pattern_mem);
        data.extend(&self.data0);
        data.extend(control);
        data.extend(&self.data1);
        data.extend(loaded_pattern);
        data.extend(&self.data2);

        assert_eq!(data.len(), IMAGE_SIZE);

        data
    }
}

impl Pattern {
    /// Construct and validate a pattern. `memo` defaults to all-zero bytes
    /// of size `ceil(height/2)` when `None`.
    pub fn new(
        number: u16,
        width: u16,
        height: u16,
        rows: Vec<Vec<bool>>,
        memo: Option<Vec<u8>>,
    ) -> Result<Self> {
        if !(1..=999).contains(&number) {
            return Err(KnittyError::InvalidPatternNumber(number));
        }
        if !(1..=999).contains(&width) {
            return Err(KnittyError::WrongSize {
                what: "pattern width",
                expected: 999,
                got: usize::from(width),
            });
        }
        if !(1..=999).contains(&height) {
            return Err(KnittyError::WrongSize {
                what: "pattern height",
                expected: 999,
                got: usize::from(height),
            });
        }
        if rows.len() != usize::from(height) {
            return Err(KnittyError::RowCountMismatch {
                expected: usize::from(height),
                got: rows.len(),
            });
        }
        for row in &rows {
            if row.len() != usize::from(width) {
                return Err(KnittyError::RowWidthMismatch {
                    expected: usize::from(width),
                    got: row.len(),
                });
            }
        }

        let expected_memo_len = memo_size(height);
        let memo = memo.unwrap_or_else(|| vec![0; expected_memo_len]);
        if memo.len() != expected_memo_len {
            return Err(KnittyError::WrongSize {
                what: "pattern memo",
                expected: expected_memo_len,
                got: memo.len(),
            });
        }

        Ok(Pattern {
            number,
            rows,
            height,
            width,
            memo,
        })
    }

    fn from_memory_dump(data: &[u8], index: usize) -> Option<Self> {
        let header = &data[index * 7..(index + 1) * 7];

        let end_offset = u16::from_be_bytes([header[0], header[1]]);
        if end_offset == 0 {
            return None;
        }

        let data_nibbles = util::to_nibbles(&header[2..]);
        let height = util::from_bcd_strict(&data_nibbles[0..3]).ok()?;
        let width = util::from_bcd_strict(&data_nibbles[3..6]).ok()?;
        let ptn_num = util::from_bcd_strict(&data_nibbles[6..10]).ok()?;

        debug!(?index, ?width, ?height, ?ptn_num, ?end_offset, "Found pattern");

        let memo_size = memo_size(height);
        let memo_end_pos = 0x7fff - end_offset as usize;
        let memo_start_pos = memo_end_pos - memo_size;

        let memo = &data[memo_start_pos + 1..memo_end_pos + 1];

        let pattern_size = pattern_data_byte_len(width, height);
        let pattern_end_pos = memo_start_pos;
        let pattern_start_pos = pattern_end_pos - pattern_size;

        let pattern = &data[pattern_start_pos + 1..pattern_end_pos + 1];

        let parsed_pattern = parse_pattern_rows(width, height, pattern);

        Some(Pattern {
            number: ptn_num,
            rows: parsed_pattern,
            height,
            width,
            memo: memo.to_vec(),
        })
    }

    pub fn from_image(pattern_number: u16, image: &GrayImage) -> EyreResult<Self> {
        let width = u16::try_from(image.width()).context("Image too wide")?;
        let height = u16::try_from(image.height()).context("Image too tall")?;

        let mut rows = vec![vec![false; width as usize]; height as usize];

        for y in 0..height {
            for x in 0..width {
                let color = image.get_pixel(x.into(), y.into())[0] < 128;
                rows[y as usize][x as usize] = color;
            }
        }

        Pattern::new(pattern_number, width, height, rows, None)
            .context("Image dimensions do not form a valid pattern")
    }

    pub fn pattern_number(&self) -> u16 {
        self.number
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn rows(&self) -> &[Vec<bool>] {
        &self.rows
    }

    pub fn memo(&self) -> &[u8] {
        &self.memo
    }

    pub fn to_image(&self) -> GrayImage {
        let mut image = GrayImage::new(u32::from(self.width), u32::from(self.height));

        for (y, row) in self.rows.iter().enumerate() {
            for (x, col) in row.iter().copied().enumerate() {
                let color = if col { 0 } else { 255 };
                *image.get_pixel_mut(x as u32, y as u32) = [color].into();
            }
        }

        image
    }

    fn serialize_header(&self, offset: u16) -> Vec<u8> {
        let mut data = vec![0, 0];
        data[0..2].copy_from_slice(&offset.to_be_bytes());

        let mut header_nibbles = Vec::with_capacity(10);
        header_nibbles.extend(util::to_bcd(self.height, 3));
        header_nibbles.extend(util::to_bcd(self.width, 3));
        header_nibbles.extend(util::to_bcd(self.number, 4));

        data.extend(util::from_nibbles(&header_nibbles));

        data
    }

    fn serialize_data(&self) -> Vec<u8> {
        let (_, row_pad_bits, initial_padding) = pattern_data_sizes(self.width, self.height);

        let mut bits = vec![false; initial_padding * 4];

        for row in &self.rows {
            bits.extend(repeat(false).take(row_pad_bits));
            bits.extend(row.iter().copied().rev());
        }

        let mut serialized = util::bits_to_bytes(&bits);
        serialized.extend(&self.memo);
        serialized
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.width == other.width
            && self.height == other.height
            && self.rows == other.rows
            && self.memo == other.memo
    }
}

impl ControlBlock {
    fn from_bytes(data: &[u8]) -> ControlBlock {
        assert_eq!(data.len(), CONTROL_BLOCK_SIZE);

        ControlBlock {
            next_pattern_ptr1: u16::from_be_bytes([data[0], data[1]]),
            unknown1: u16::from_be_bytes([data[2], data[3]]),
            next_pattern_ptr2: u16::from_be_bytes([data[4], data[5]]),
            last_pattern_end_ptr: u16::from_be_bytes([data[6], data[7]]),
            unknown2: u16::from_be_bytes([data[8], data[9]]),
            last_pattern_start_ptr: u16::from_be_bytes([data[10], data[11]]),
            unknown3: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            header_end_ptr: u16::from_be_bytes([data[16], data[17]]),
            unknown_ptr: u16::from_be_bytes([data[18], data[19]]),
            unknown4_1: u16::from_be_bytes([data[20], data[21]]),
            unknown4_2: data[22],
        }
    }

    fn update(&mut self, pattern_layout: &[(u16, &Pattern, Vec<u8>)]) {
        let last_pattern_start;
        let last_pattern_end;
        let next_pattern_ptr;

        if let Some((end, _, data)) = pattern_layout.last() {
            last_pattern_end = *end;
            last_pattern_start = *end + data.len() as u16;
            next_pattern_ptr = last_pattern_start + 1;
        } else {
            next_pattern_ptr = PATTERN_DATA_START;
            last_pattern_start = 0;
            last_pattern_end = 0;
        }

        self.next_pattern_ptr1 = next_pattern_ptr;
        self.next_pattern_ptr2 = if pattern_layout.is_empty() {
            0
        } else {
            next_pattern_ptr
        };
        self.last_pattern_end_ptr = last_pattern_end;
        self.last_pattern_start_ptr = last_pattern_start;
        self.header_end_ptr = (0x8000 - (7 * pattern_layout.len()) - 7) as u16;
    }

    fn serialize(&self) -> [u8; CONTROL_BLOCK_SIZE] {
        let mut data = [0; CONTROL_BLOCK_SIZE];

        data[0..2].copy_from_slice(&self.next_pattern_ptr1.to_be_bytes());
        data[2..4].copy_from_slice(&self.unknown1.to_be_bytes());
        data[4..6].copy_from_slice(&self.next_pattern_ptr2.to_be_bytes());
        data[6..8].copy_from_slice(&self.last_pattern_end_ptr.to_be_bytes());
        data[8..10].copy_from_slice(&self.unknown2.to_be_bytes());
        data[10..12].copy_from_slice(&self.last_pattern_start_ptr.to_be_bytes());
        data[12..16].copy_from_slice(&self.unknown3.to_be_bytes());
        data[16..18].copy_from_slice(&self.header_end_ptr.to_be_bytes());
        data[18..20].copy_from_slice(&self.unknown_ptr.to_be_bytes());
        data[20..22].copy_from_slice(&self.unknown4_1.to_be_bytes());
        data[22] = self.unknown4_2;

        data
    }
}

fn memo_size(height: u16) -> usize {
    (if height % 2 == 0 {
        height / 2
    } else {
        height / 2 + 1
    }) as usize
}

fn pattern_data_sizes(width: u16, height: u16) -> (usize, usize, usize) {
    let row_nibbles = (f32::from(width) / 4.0).ceil() as usize;
    let row_pad_bits = util::padding(usize::from(width), 4);

    let initial_padding = util::padding(row_nibbles * usize::from(height), 2);

    (row_nibbles, row_pad_bits, initial_padding)
}

fn pattern_data_byte_len(width: u16, height: u16) -> usize {
    ((f32::from(width) / 4.0).ceil() * f32::from(height) / 2.0).ceil() as usize
}

fn parse_pattern_rows(width: u16, height: u16, data: &[u8]) -> Vec<Vec<bool>> {
    let (row_nibbles, row_pad_bits, initial_padding) = pattern_data_sizes(width, height);

    let nibble_data = util::to_nibbles(data);

    (0..usize::from(height))
        .map(|row| {
            let start_index = initial_padding + row_nibbles * row;
            let end_index = start_index + row_nibbles;

            let bits = util::nibble_bits(&nibble_data[start_index..end_index]);

            bits[row_pad_bits..].iter().copied().rev().collect()
        })
        .collect()
}

fn serialize_header_table(layout: &[(u16, &Pattern, Vec<u8>)]) -> Vec<u8> {
    let mut data = vec![];

    for (offset, pattern, _) in layout {
        data.extend(pattern.serialize_header(*offset));
    }

    let max_number = if layout.is_empty() || layout.len() >= PATTERN_COUNT {
        900
    } else {
        layout.iter().map(|(_, p, _)| p.number).max().unwrap_or(900)
    };

    data.extend([0, 0, 0, 0, 0]);
    data.extend(util::from_nibbles(&util::to_bcd(max_number + 1, 4)));

    let pad_patterns = (PATTERN_COUNT - 1) - layout.len();
    data.extend(repeat(0).take(pad_patterns * 7));

    assert_eq!(data.len(), HEADER_TABLE_LEN);

    data
}

fn serialize_pattern_memory_padding(layout: &[(u16, &Pattern, Vec<u8>)]) -> Vec<u8> {
    let last_pattern_end = if let Some((end, _, data)) = layout.last() {
        *end as usize + data.len()
    } else {
        usize::from(PATTERN_DATA_START)
    };

    let pattern_pad = 0x8000 - last_pattern_end - HEADER_TABLE_LEN;

    vec![0; pattern_pad]
}

fn serialize_pattern_memory(layout: &[(u16, &Pattern, Vec<u8>)]) -> Vec<u8> {
    let mut data = Vec::with_capacity(layout.len() * HEADER_TABLE_LEN);

    for (_, _, pattern_data) in layout.iter().rev() {
        data.extend(pattern_data);
    }

    data
}

fn serialize_loaded_pattern(pattern: u16) -> Vec<u8> {
    let mut nibbles = vec![Nibble::new(1)];
    nibbles.extend(util::to_bcd(pattern, 3));
    util::from_nibbles(&nibbles)
}

#[test]
fn empty_state_serializes_to_32768_zero_bytes_with_known_trailer() {
    let mut state = MachineState::empty();
    let data = state.serialize();

    assert_eq!(data.len(), IMAGE_SIZE);
    assert_eq!(&data[0x02a9..0x02ae], &[0, 0, 0, 0, 0]);
    assert_eq!(
        &data[0x02ae..0x02b0],
        &util::from_nibbles(&util::to_bcd(901, 4))[..]
    );
    assert_eq!(&data[0x7f00..0x7f02], &[0x01, 0x20]);
    assert_eq!(&data[0x7f04..0x7f06], &[0x00, 0x00]);
    assert_eq!(&data[0x7f10..0x7f12], &[0x7f, 0xf9]);

    for &b in &data[0x02b0..0x7ee0] {
        assert_eq!(b, 0);
    }
    for &b in &data[0x7ee0..0x7f00] {
        assert_eq!(b, 0);
    }
    for &b in &data[0x7fec..0x8000] {
        assert_eq!(b, 0);
    }
}

#[test]
fn empty_state_round_trips() {
    let mut state = MachineState::empty();
    let data = state.serialize();
    let parsed = MachineState::from_memory_dump(&data).unwrap();

    assert!(parsed.patterns().is_empty());
    assert_eq!(parsed.data0, vec![0; DATA0_LEN]);
    assert_eq!(parsed.data1, vec![0; DATA1_LEN]);
    assert_eq!(parsed.data2, vec![0; DATA2_LEN]);
    assert_eq!(parsed.loaded_pattern(), 0);
}

#[test]
fn single_pattern_header_matches_spec_example() {
    let pattern = Pattern::new(
        500,
        4,
        2,
        vec![
            vec![true, false, true, false],
            vec![false, true, false, true],
        ],
        None,
    )
    .unwrap();

    let header = pattern.serialize_header(0x0020);
    let expected_nibbles = util::from_nibbles(&[
        Nibble::new(0),
        Nibble::new(0),
        Nibble::new(2),
        Nibble::new(0),
        Nibble::new(0),
        Nibble::new(4),
        Nibble::new(0),
        Nibble::new(5),
        Nibble::new(0),
        Nibble::new(0),
    ]);
    let mut expected = vec![0x00, 0x20];
    expected.extend(expected_nibbles);

    assert_eq!(header, expected);
}

#[test]
fn single_pattern_round_trips_through_machine_state() {
    let pattern = Pattern::new(
        500,
        4,
        2,
        vec![
            vec![true, false, true, false],
            vec![false, true, false, true],
        ],
        None,
    )
    .unwrap();

    let mut state = MachineState::empty();
    state.add_pattern(pattern).unwrap();

    let data = state.serialize();
    let parsed = MachineState::from_memory_dump(&data).unwrap();

    assert_eq!(parsed.patterns().len(), 1);
    let round_tripped = &parsed.patterns()[0];
    assert_eq!(round_tripped.pattern_number(), 500);
    assert_eq!(round_tripped.width(), 4);
    assert_eq!(round_tripped.height(), 2);
    assert_eq!(
        round_tripped.rows(),
        &[
            vec![true, false, true, false],
            vec![false, true, false, true],
        ]
    );
    assert_eq!(round_tripped.memo(), &[0]);
}

#[test]
fn pattern_data_length_matches_invariant() {
    let pattern = Pattern::new(1, 9, 5, vec![vec![false; 9]; 5], None).unwrap();
    let data = pattern.serialize_data();

    let row_nibbles = (9f32 / 4.0).ceil() as usize;
    let expected_pattern_bytes = ((row_nibbles * 5) as f32 / 2.0).ceil() as usize;
    let expected_memo_bytes = memo_size(5);

    assert_eq!(data.len(), expected_pattern_bytes + expected_memo_bytes);
}

#[test]
fn pattern_rejects_mismatched_row_width() {
    let err = Pattern::new(1, 4, 1, vec![vec![false; 3]], None).unwrap_err();
    assert!(matches!(err, KnittyError::RowWidthMismatch { .. }));
}

#[test]
fn pattern_rejects_out_of_range_number() {
    let err = Pattern::new(0, 4, 1, vec![vec![false; 4]], None).unwrap_err();
    assert!(matches!(err, KnittyError::InvalidPatternNumber(0)));
}

#[test]
fn pattern_rejects_oversized_dimensions() {
    let err = Pattern::new(1, 1000, 1, vec![vec![false; 1000]], None).unwrap_err();
    assert!(matches!(err, KnittyError::WrongSize { what: "pattern width", .. }));

    let err = Pattern::new(1, 4, 1000, vec![vec![false; 4]; 1000], None).unwrap_err();
    assert!(matches!(err, KnittyError::WrongSize { what: "pattern height", .. }));
}

#[test]
fn add_pattern_replaces_same_number() {
    let mut state = MachineState::empty();
    state
        .add_pattern(Pattern::new(1, 1, 1, vec![vec![true]], None).unwrap())
        .unwrap();
    state
        .add_pattern(Pattern::new(1, 2, 1, vec![vec![true, false]], None).unwrap())
        .unwrap();

    assert_eq!(state.patterns().len(), 1);
    assert_eq!(state.patterns()[0].width(), 2);
}

#[test]
fn multiple_patterns_preserve_set_on_round_trip() {
    let mut state = MachineState::empty();
    state
        .add_pattern(Pattern::new(1, 4, 2, vec![vec![true, false, true, false]; 2], None).unwrap())
        .unwrap();
    state
        .add_pattern(Pattern::new(999, 8, 3, vec![vec![false; 8]; 3], None).unwrap())
        .unwrap();
    state
        .add_pattern(Pattern::new(42, 2, 2, vec![vec![true, true]; 2], None).unwrap())
        .unwrap();

    let data = state.serialize();
    let parsed = MachineState::from_memory_dump(&data).unwrap();

    let mut numbers: Vec<u16> = parsed
        .patterns()
        .iter()
        .map(|p| p.pattern_number())
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 42, 999]);
}
