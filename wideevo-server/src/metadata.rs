//! Minimal EXIF block builder.
//!
//! Produces the payload of an APP1 segment: the `Exif\0\0` identifier
//! followed by a big-endian ("MM") TIFF structure. IFD0 holds the
//! orientation and the camera identity strings; version, serial and lens
//! tags live in an Exif sub-IFD linked from IFD0. All offsets and counts
//! are computed from the entry lists, so adding tags never requires
//! touching magic numbers.

use crate::error::MetadataError;

pub const EXIF_IDENTIFIER: &[u8; 6] = b"Exif\0\0";

pub const TAG_MAKE: u16 = 0x010F;
pub const TAG_MODEL: u16 = 0x0110;
pub const TAG_ORIENTATION: u16 = 0x0112;
pub const TAG_SOFTWARE: u16 = 0x0131;
pub const TAG_EXIF_IFD_POINTER: u16 = 0x8769;
pub const TAG_EXIF_VERSION: u16 = 0x9000;
pub const TAG_MAKER_NOTE: u16 = 0x927C;
pub const TAG_BODY_SERIAL_NUMBER: u16 = 0xA431;
pub const TAG_LENS_MAKE: u16 = 0xA433;
pub const TAG_LENS_MODEL: u16 = 0xA434;
pub const TAG_LENS_SERIAL_NUMBER: u16 = 0xA435;

// FujiFilm maker note: "FUJIFILM", a little-endian offset to its IFD, then
// the IFD itself. Offsets inside are relative to the start of the note.
const FUJI_MAKER_NOTE_HEADER: &[u8; 8] = b"FUJIFILM";
const FUJI_IFD_OFFSET: u32 = 12;
const FUJI_TAG_VERSION: u16 = 0x0000;
const FUJI_TAG_INTERNAL_SERIAL: u16 = 0x0010;

const TIFF_HEADER_LEN: usize = 8;
const IFD_ENTRY_LEN: usize = 12;
const INLINE_VALUE_LEN: usize = 4;
/// ExifVersion and the FujiFilm version are four ASCII digits, e.g. `0232`.
const VERSION_LEN: usize = 4;

/// EXIF Orientation values (tag 0x0112).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Orientation {
    Normal = 1,
    MirrorHorizontal = 2,
    Rotate180 = 3,
    MirrorVertical = 4,
    MirrorHorizontalRotate270 = 5,
    Rotate90 = 6,
    MirrorHorizontalRotate90 = 7,
    Rotate270 = 8,
}

impl Orientation {
    pub fn value(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Orientation {
    type Error = MetadataError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Orientation::Normal,
            2 => Orientation::MirrorHorizontal,
            3 => Orientation::Rotate180,
            4 => Orientation::MirrorVertical,
            5 => Orientation::MirrorHorizontalRotate270,
            6 => Orientation::Rotate90,
            7 => Orientation::MirrorHorizontalRotate90,
            8 => Orientation::Rotate270,
            other => return Err(MetadataError::InvalidOrientation(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn u16(self, v: u16) -> [u8; 2] {
        match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        }
    }

    fn u32(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum FieldType {
    Ascii = 2,
    Short = 3,
    Long = 4,
    Undefined = 7,
}

#[derive(Debug, Clone)]
enum EntryValue {
    Short(u16),
    Long(u32),
    /// ASCII (already NUL-terminated) or UNDEFINED bytes.
    Bytes(Vec<u8>),
}

/// One typed IFD entry. Values are encoded when the IFD is written, in that
/// IFD's byte order.
#[derive(Debug, Clone)]
struct IfdEntry {
    tag: u16,
    field_type: FieldType,
    value: EntryValue,
}

impl IfdEntry {
    fn short(tag: u16, v: u16) -> Self {
        Self {
            tag,
            field_type: FieldType::Short,
            value: EntryValue::Short(v),
        }
    }

    fn long(tag: u16, v: u32) -> Self {
        Self {
            tag,
            field_type: FieldType::Long,
            value: EntryValue::Long(v),
        }
    }

    /// NUL-terminated ASCII; the count includes the terminator.
    fn ascii(tag: u16, s: &str) -> Self {
        let mut data: Vec<u8> = s.bytes().filter(|b| *b != 0).collect();
        data.push(0);
        Self {
            tag,
            field_type: FieldType::Ascii,
            value: EntryValue::Bytes(data),
        }
    }

    fn undefined(tag: u16, data: Vec<u8>) -> Self {
        Self {
            tag,
            field_type: FieldType::Undefined,
            value: EntryValue::Bytes(data),
        }
    }

    fn count(&self) -> u32 {
        match &self.value {
            EntryValue::Short(_) | EntryValue::Long(_) => 1,
            EntryValue::Bytes(b) => b.len() as u32,
        }
    }

    fn encode(&self, order: ByteOrder) -> Vec<u8> {
        match &self.value {
            EntryValue::Short(v) => order.u16(*v).to_vec(),
            EntryValue::Long(v) => order.u32(*v).to_vec(),
            EntryValue::Bytes(b) => b.clone(),
        }
    }

    /// Bytes this entry needs after the IFD, padded to a word boundary.
    fn out_of_line_len(&self) -> usize {
        let n = match &self.value {
            EntryValue::Short(_) => 2,
            EntryValue::Long(_) => 4,
            EntryValue::Bytes(b) => b.len(),
        };
        if n <= INLINE_VALUE_LEN { 0 } else { n + n % 2 }
    }
}

/// Size of an IFD table plus its data area.
fn ifd_len(entries: &[IfdEntry]) -> usize {
    2 + entries.len() * IFD_ENTRY_LEN
        + 4
        + entries.iter().map(IfdEntry::out_of_line_len).sum::<usize>()
}

/// Append an IFD (sorted by tag, next-IFD offset 0) followed by its data
/// area. Offsets are positions in `out`, so `out` must start at the base the
/// reader resolves offsets against.
fn write_ifd(out: &mut Vec<u8>, mut entries: Vec<IfdEntry>, order: ByteOrder) {
    entries.sort_by_key(|e| e.tag);
    let data_start = out.len() + 2 + entries.len() * IFD_ENTRY_LEN + 4;
    let mut data_area: Vec<u8> = Vec::new();

    out.extend_from_slice(&order.u16(entries.len() as u16));
    for e in &entries {
        let data = e.encode(order);
        out.extend_from_slice(&order.u16(e.tag));
        out.extend_from_slice(&order.u16(e.field_type as u16));
        out.extend_from_slice(&order.u32(e.count()));
        if data.len() <= INLINE_VALUE_LEN {
            let mut inline = [0u8; INLINE_VALUE_LEN];
            inline[..data.len()].copy_from_slice(&data);
            out.extend_from_slice(&inline);
        } else {
            out.extend_from_slice(&order.u32((data_start + data_area.len()) as u32));
            data_area.extend_from_slice(&data);
            if data_area.len() % 2 == 1 {
                data_area.push(0);
            }
        }
    }
    out.extend_from_slice(&order.u32(0));
    out.extend_from_slice(&data_area);
}

/// Camera identity written next to the orientation. Empty strings are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraIdentity {
    pub make: Option<String>,
    pub model: Option<String>,
    pub software: Option<String>,
    pub serial_number: Option<String>,
    /// FujiFilm maker note tag.
    pub internal_serial_number: Option<String>,
    pub lens_make: Option<String>,
    pub lens_model: Option<String>,
    pub lens_serial_number: Option<String>,
    /// Four characters, e.g. `0232`.
    pub exif_version: Option<String>,
    /// Four characters, FujiFilm maker note tag.
    pub fujifilm_version: Option<String>,
}

impl CameraIdentity {
    pub fn is_empty(&self) -> bool {
        [
            &self.make,
            &self.model,
            &self.software,
            &self.serial_number,
            &self.internal_serial_number,
            &self.lens_make,
            &self.lens_model,
            &self.lens_serial_number,
            &self.exif_version,
            &self.fujifilm_version,
        ]
        .into_iter()
        .all(|v| non_empty(v).is_none())
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

fn version_bytes(name: &str, v: &Option<String>) -> Option<Vec<u8>> {
    let v = non_empty(v)?;
    if v.len() != VERSION_LEN || !v.is_ascii() {
        tracing::warn!(field = name, value = v, "version must be 4 ASCII characters, skipping");
        return None;
    }
    Some(v.as_bytes().to_vec())
}

fn fuji_maker_note(version: Option<Vec<u8>>, internal_serial: Option<&str>) -> Vec<u8> {
    let mut entries = Vec::new();
    if let Some(v) = version {
        entries.push(IfdEntry::undefined(FUJI_TAG_VERSION, v));
    }
    if let Some(s) = internal_serial {
        entries.push(IfdEntry::ascii(FUJI_TAG_INTERNAL_SERIAL, s));
    }
    let mut note = FUJI_MAKER_NOTE_HEADER.to_vec();
    note.extend_from_slice(&ByteOrder::Little.u32(FUJI_IFD_OFFSET));
    write_ifd(&mut note, entries, ByteOrder::Little);
    note
}

/// Fixed part of the EXIF block. Orientation is supplied per call to
/// [`ExifTemplate::build`], so one template can be shared across photos.
#[derive(Debug, Clone, Default)]
pub struct ExifTemplate {
    ifd0: Vec<IfdEntry>,
    exif_ifd: Vec<IfdEntry>,
}

impl ExifTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(identity: &CameraIdentity) -> Self {
        let mut template = Self::new();
        for (tag, value) in [
            (TAG_MAKE, &identity.make),
            (TAG_MODEL, &identity.model),
            (TAG_SOFTWARE, &identity.software),
        ] {
            if let Some(v) = non_empty(value) {
                template.ifd0.push(IfdEntry::ascii(tag, v));
            }
        }

        if let Some(v) = version_bytes("exif_version", &identity.exif_version) {
            template.exif_ifd.push(IfdEntry::undefined(TAG_EXIF_VERSION, v));
        }
        for (tag, value) in [
            (TAG_BODY_SERIAL_NUMBER, &identity.serial_number),
            (TAG_LENS_MAKE, &identity.lens_make),
            (TAG_LENS_MODEL, &identity.lens_model),
            (TAG_LENS_SERIAL_NUMBER, &identity.lens_serial_number),
        ] {
            if let Some(v) = non_empty(value) {
                template.exif_ifd.push(IfdEntry::ascii(tag, v));
            }
        }
        let fuji_version = version_bytes("fujifilm_version", &identity.fujifilm_version);
        let internal_serial = non_empty(&identity.internal_serial_number);
        if fuji_version.is_some() || internal_serial.is_some() {
            template.exif_ifd.push(IfdEntry::undefined(
                TAG_MAKER_NOTE,
                fuji_maker_note(fuji_version, internal_serial),
            ));
        }
        template
    }

    /// Serialize identifier + TIFF header + IFD0 (+ Exif IFD when present).
    pub fn build(&self, orientation: Orientation) -> Vec<u8> {
        let order = ByteOrder::Big;
        let mut ifd0 = self.ifd0.clone();
        ifd0.push(IfdEntry::short(TAG_ORIENTATION, orientation.value()));
        if !self.exif_ifd.is_empty() {
            // The pointer is an inline LONG, so its value does not change the IFD0 size.
            let exif_offset = TIFF_HEADER_LEN + ifd_len(&ifd0) + IFD_ENTRY_LEN;
            ifd0.push(IfdEntry::long(TAG_EXIF_IFD_POINTER, exif_offset as u32));
        }

        let mut tiff = Vec::with_capacity(
            TIFF_HEADER_LEN + ifd_len(&ifd0) + ifd_len(&self.exif_ifd),
        );
        tiff.extend_from_slice(b"MM");
        tiff.extend_from_slice(&order.u16(42));
        tiff.extend_from_slice(&order.u32(TIFF_HEADER_LEN as u32));
        write_ifd(&mut tiff, ifd0, order);
        if !self.exif_ifd.is_empty() {
            write_ifd(&mut tiff, self.exif_ifd.clone(), order);
        }

        let mut out = Vec::with_capacity(EXIF_IDENTIFIER.len() + tiff.len());
        out.extend_from_slice(EXIF_IDENTIFIER);
        out.extend_from_slice(&tiff);
        out
    }
}

/// EXIF payload carrying only the Orientation tag.
pub fn build_orientation_segment(orientation: Orientation) -> Vec<u8> {
    ExifTemplate::new().build(orientation)
}
