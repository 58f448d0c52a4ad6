// amber-snapshot - Snapshot image encoder/decoder for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The decoded-image mapping: every byte of an accepted image accounted for.
//!
//! Decoding records one component per field it visits - header fields, table
//! entries, global slots, allocations. Finalizing sorts them, fills the gaps
//! with `UnusedSpace` components (which carry the actual skipped bytes, so
//! the mapping always reassembles bit-exactly), and flags overlaps. The
//! result pretty-prints as a table keyed by offset, logical address and size.

use std::fmt;

/// Which part of the image a component belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Header,
    ImportTable,
    ExportTable,
    ShortCallTable,
    StringTable,
    Rom,
    Globals,
    GcRoots,
    GcHeap,
}

impl Region {
    pub fn name(self) -> &'static str {
        match self {
            Region::Header => "header",
            Region::ImportTable => "import table",
            Region::ExportTable => "export table",
            Region::ShortCallTable => "short-call table",
            Region::StringTable => "string table",
            Region::Rom => "rom",
            Region::Globals => "globals",
            Region::GcRoots => "gc roots",
            Region::GcHeap => "gc heap",
        }
    }
}

/// What a component is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Field,
    Allocation,
    UnusedSpace,
    /// Zero-sized marker emitted where two components claim the same bytes.
    OverlapWarning,
}

/// One decoded piece of the image.
#[derive(Debug, Clone)]
pub struct Component {
    pub offset: usize,
    pub size: usize,
    /// Address in the 16-bit logical space, when the component has one.
    pub logical_address: Option<u16>,
    pub region: Region,
    pub kind: ComponentKind,
    pub label: String,
    /// The exact bytes this component covers.
    pub content: Vec<u8>,
}

/// All components of a decoded image.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMapping {
    components: Vec<Component>,
    image_size: usize,
}

impl SnapshotMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    pub(crate) fn push_field(
        &mut self,
        region: Region,
        offset: usize,
        bytes: &[u8],
        logical_address: Option<u16>,
        label: impl Into<String>,
    ) {
        self.push(Component {
            offset,
            size: bytes.len(),
            logical_address,
            region,
            kind: ComponentKind::Field,
            label: label.into(),
            content: bytes.to_vec(),
        });
    }

    /// Sort by offset, insert gap fillers and overlap markers, and record
    /// the image size.
    pub(crate) fn finalize(&mut self, bytes: &[u8]) {
        self.image_size = bytes.len();
        self.components
            .sort_by_key(|c| (c.offset, std::cmp::Reverse(c.size)));
        let mut cursor = 0usize;
        let mut extra: Vec<Component> = Vec::new();
        for component in &self.components {
            if component.kind == ComponentKind::OverlapWarning {
                continue;
            }
            if component.offset > cursor {
                extra.push(Component {
                    offset: cursor,
                    size: component.offset - cursor,
                    logical_address: None,
                    region: component.region,
                    kind: ComponentKind::UnusedSpace,
                    label: "UnusedSpace".to_string(),
                    content: bytes[cursor..component.offset].to_vec(),
                });
            } else if component.offset < cursor {
                extra.push(Component {
                    offset: component.offset,
                    size: 0,
                    logical_address: None,
                    region: component.region,
                    kind: ComponentKind::OverlapWarning,
                    label: format!("OverlapWarning at {:#06x}", component.offset),
                    content: Vec::new(),
                });
            }
            cursor = cursor.max(component.offset + component.size);
        }
        if cursor < bytes.len() {
            extra.push(Component {
                offset: cursor,
                size: bytes.len() - cursor,
                logical_address: None,
                region: Region::GcHeap,
                kind: ComponentKind::UnusedSpace,
                label: "UnusedSpace".to_string(),
                content: bytes[cursor..].to_vec(),
            });
        }
        self.components.extend(extra);
        self.components
            .sort_by_key(|c| (c.offset, std::cmp::Reverse(c.size)));
    }

    /// Rebuild the image from the components. For any image the decoder
    /// accepts this is bit-exact.
    pub fn reassemble(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.image_size];
        for component in &self.components {
            if component.kind == ComponentKind::OverlapWarning {
                continue;
            }
            let end = (component.offset + component.size).min(out.len());
            if component.offset < end {
                out[component.offset..end]
                    .copy_from_slice(&component.content[..end - component.offset]);
            }
        }
        out
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Components of one region, in offset order.
    pub fn region(&self, region: Region) -> impl Iterator<Item = &Component> {
        self.components.iter().filter(move |c| c.region == region)
    }

    /// True when any overlap was flagged.
    pub fn has_overlaps(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.kind == ComponentKind::OverlapWarning)
    }
}

impl fmt::Display for SnapshotMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>8}  {:>6}  {:>6}  {:<16}  {}", "offset", "addr", "size", "region", "label")?;
        for c in &self.components {
            let addr = c
                .logical_address
                .map(|a| format!("{:04x}", a))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:>8}  {:>6}  {:>6}  {:<16}  {}",
                format!("{:04x}", c.offset),
                addr,
                c.size,
                c.region.name(),
                c.label
            )?;
        }
        Ok(())
    }
}
