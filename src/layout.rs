//! Flash layout text parser.
//!
//! A layout is a list of rows, each row holding six TAB separated fields:
//!
//! ```text
//! #Opt	Id	Name	Type	IP	Offset
//! P	0x01	fsbl1-boot	Binary	none	0x0
//! P	0x04	fip	FIP	nor	0x00080000
//! ```
//!
//! Rows starting with `#` are comments. `Id` and `Offset` accept a `0x`
//! prefix for hex and a leading `0` for octal.

use heapless::{String, Vec};

use crate::error::LayoutError;

/// Maximum number of partitions in a layout.
pub const MAX_PARTITIONS: usize = 15;

/// Maximum length of a text field.
pub const FIELD_SIZE: usize = 32;

/// Text field of a partition entry.
pub type Field = String<FIELD_SIZE>;

/// One partition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Option flags, e.g. `P` (program) or `-` (skip)
    pub option: Field,
    /// Partition id, matched against phase ids
    pub id: u32,
    /// Partition name
    pub name: Field,
    /// Partition type, e.g. `Binary`
    pub kind: Field,
    /// Storage interface: `none`, `nor` or `mmc`
    pub interface: Field,
    /// Offset inside the storage
    pub offset: u32,
}

/// Ordered partition table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashLayout {
    entries: Vec<PartitionEntry, MAX_PARTITIONS>,
}

impl FlashLayout {
    /// Empty table.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Parse layout text.
    ///
    /// Parsing stops at the first NUL byte. A last row without a newline is
    /// incomplete and ignored.
    pub fn parse(text: &[u8]) -> Result<Self, LayoutError> {
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        let text = &text[..end];

        // only newline terminated rows
        let complete = match text.iter().rposition(|&b| b == b'\n') {
            Some(pos) => &text[..pos],
            None => return Ok(Self::new()),
        };

        let complete = core::str::from_utf8(complete).map_err(|_| LayoutError::Encoding)?;

        let mut layout = Self::new();
        for (row, line) in complete.split('\n').enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = parse_row(row, line)?;
            layout
                .entries
                .push(entry)
                .map_err(|_| LayoutError::TooManyPartitions)?;
        }
        Ok(layout)
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the table has no partitions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every partition.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Partitions in table order.
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Partition at `index`.
    pub fn get(&self, index: usize) -> Option<&PartitionEntry> {
        self.entries.get(index)
    }

    /// First partition with `id`, and its index.
    pub fn find(&self, id: u32) -> Option<(usize, &PartitionEntry)> {
        self.entries.iter().enumerate().find(|(_, e)| e.id == id)
    }
}

fn parse_row(row: usize, line: &str) -> Result<PartitionEntry, LayoutError> {
    let mut fields = line.split('\t');
    let mut next = || fields.next().ok_or(LayoutError::FieldCount { row });

    let option = text_field(row, next()?)?;
    let id = number_field(row, next()?)?;
    let name = text_field(row, next()?)?;
    let kind = text_field(row, next()?)?;
    let interface = text_field(row, next()?)?;
    let offset = number_field(row, next()?)?;

    if fields.next().is_some() {
        return Err(LayoutError::FieldCount { row });
    }

    Ok(PartitionEntry {
        option,
        id,
        name,
        kind,
        interface,
        offset,
    })
}

fn text_field(row: usize, s: &str) -> Result<Field, LayoutError> {
    let mut field = Field::new();
    field
        .push_str(s.trim())
        .map_err(|_| LayoutError::FieldTooLong { row })?;
    Ok(field)
}

fn number_field(row: usize, s: &str) -> Result<u32, LayoutError> {
    parse_number(s.trim()).ok_or(LayoutError::Number { row })
}

/// Parse an unsigned number, the base follows the prefix like C `strtoul(s, _, 0)`.
pub fn parse_number(s: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}
