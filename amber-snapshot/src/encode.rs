// amber-snapshot - Snapshot image encoder/decoder for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Snapshot encoding: VM state in, relocatable byte image out.
//!
//! The encoder walks the root set (globals in declaration order, then
//! exports) breadth-first, interning strings and boxed numbers and
//! discovering reachable heap allocations and functions. Sizes are all
//! schema-derived, so layout happens before a single value is resolved;
//! the write pass then encodes every cross-reference as a 16-bit logical
//! address. `bytecodeSize` and the CRC are back-patched last.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};

use amber_il::{AllocationId, Function, FunctionId, Operand, OperandSchema, Value};
use amber_vm::{Allocation, SnapshotInfo};

use crate::error::EncodeError;
use crate::format::{self, Section, TypeCode};

/// Encode a snapshot image.
pub fn encode_snapshot(info: &SnapshotInfo) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::new(info);
    encoder.discover()?;
    encoder.layout()?;
    encoder.write()
}

/// A number that needs a ROM box: its bit pattern and whether it fits an
/// `Int32` box.
#[derive(Debug, Clone, Copy)]
struct BoxedNumber {
    bits: u64,
    is_int32: bool,
}

struct Encoder<'a> {
    info: &'a SnapshotInfo,
    global_index: IndexMap<&'a str, u16>,

    // Discovery results.
    gc_order: IndexSet<AllocationId>,
    function_order: IndexSet<FunctionId>,
    strings: IndexSet<String>,
    numbers: Vec<BoxedNumber>,
    host_ids: Vec<u16>,

    // Layout results (payload offsets).
    function_offsets: IndexMap<FunctionId, usize>,
    string_offsets: IndexMap<String, usize>,
    number_offsets: IndexMap<u64, usize>,
    host_offsets: IndexMap<u16, usize>,
    gc_offsets: IndexMap<AllocationId, usize>,
    section_layout: IndexMap<&'static str, (usize, usize)>,
    data_offset: usize,
    heap_offset: usize,
    total_size: usize,
}

impl<'a> Encoder<'a> {
    fn new(info: &'a SnapshotInfo) -> Self {
        let global_index = info
            .globals
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.as_str(), i as u16))
            .collect();
        Self {
            info,
            global_index,
            gc_order: IndexSet::new(),
            function_order: IndexSet::new(),
            strings: IndexSet::new(),
            numbers: Vec::new(),
            host_ids: Vec::new(),
            function_offsets: IndexMap::new(),
            string_offsets: IndexMap::new(),
            number_offsets: IndexMap::new(),
            host_offsets: IndexMap::new(),
            gc_offsets: IndexMap::new(),
            section_layout: IndexMap::new(),
            data_offset: 0,
            heap_offset: 0,
            total_size: 0,
        }
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    fn discover(&mut self) -> Result<(), EncodeError> {
        let mut queue: VecDeque<Value> = VecDeque::new();
        queue.extend(self.info.globals.iter().map(|(_, v)| v.clone()));
        queue.extend(self.info.exports.values().cloned());

        let mut seen_numbers: IndexSet<u64> = IndexSet::new();
        let mut host_ids: IndexSet<u16> = IndexSet::new();

        while let Some(value) = queue.pop_front() {
            match value {
                Value::Undefined | Value::Null | Value::Boolean(_) => {}
                Value::Number(n) => {
                    if let Some(boxed) = boxed_number(n) {
                        if seen_numbers.insert(boxed.bits) {
                            self.numbers.push(boxed);
                        }
                    }
                }
                Value::String(s) => {
                    self.strings.insert(s.to_string());
                }
                Value::Reference(id) => {
                    if self.gc_order.insert(id) {
                        let allocation = self.info.allocations.get(&id).ok_or_else(|| {
                            EncodeError::DanglingReference(format!("allocation {}", id))
                        })?;
                        if let Allocation::Object(properties) = allocation {
                            for key in properties.keys() {
                                self.strings.insert(key.clone());
                            }
                        }
                        queue.extend(allocation.slots().cloned());
                    }
                }
                Value::Function(id) => {
                    if self.function_order.insert(id) {
                        let function = self.info.functions.get(&id).ok_or_else(|| {
                            EncodeError::DanglingReference(format!("function {}", id))
                        })?;
                        for op in function.operations() {
                            for operand in &op.operands {
                                if let Operand::Literal(value) = operand {
                                    queue.push_back(value.clone());
                                }
                            }
                        }
                    }
                }
                Value::HostFunction(id) => {
                    host_ids.insert(id.0);
                }
                Value::Ephemeral(_) => return Err(EncodeError::EphemeralInSnapshot),
            }
        }

        self.host_ids = {
            let mut ids: Vec<u16> = host_ids.into_iter().collect();
            ids.sort_unstable();
            ids
        };
        self.strings.sort();
        Ok(())
    }

    // =========================================================================
    // Layout
    // =========================================================================

    fn layout(&mut self) -> Result<(), EncodeError> {
        let mut cursor = format::HEADER_SIZE as usize;

        let import_size = 2 * self.host_ids.len();
        self.section_layout
            .insert(Section::ImportTable.name(), (cursor, import_size));
        cursor += import_size;

        let export_size = 4 * self.info.exports.len();
        self.section_layout
            .insert(Section::ExportTable.name(), (cursor, export_size));
        cursor += export_size;

        self.section_layout
            .insert(Section::ShortCallTable.name(), (cursor, 0));

        let string_table_size = 2 * self.strings.len();
        self.section_layout
            .insert(Section::StringTable.name(), (cursor, string_table_size));
        cursor += string_table_size;

        // ROM allocations: functions, interned strings, boxed numbers, host
        // function references. Pointers address payloads, so every payload
        // must land within the 14-bit PGM window.
        let functions: Vec<FunctionId> = self.function_order.iter().copied().collect();
        for id in functions {
            let function = &self.info.functions[&id];
            let size = function_payload_size(function)?;
            let payload = self.place_rom(&mut cursor, size)?;
            self.function_offsets.insert(id, payload);
        }
        let strings: Vec<String> = self.strings.iter().cloned().collect();
        for s in strings {
            let payload = self.place_rom(&mut cursor, s.len())?;
            self.string_offsets.insert(s, payload);
        }
        for boxed in self.numbers.clone() {
            let size = if boxed.is_int32 { 4 } else { 8 };
            let payload = self.place_rom(&mut cursor, size)?;
            self.number_offsets.insert(boxed.bits, payload);
        }
        for id in self.host_ids.clone() {
            let payload = self.place_rom(&mut cursor, 2)?;
            self.host_offsets.insert(id, payload);
        }

        self.data_offset = cursor;
        let data_size = 2 * self.info.globals.len();
        self.section_layout
            .insert(Section::InitialData.name(), (cursor, data_size));
        cursor += data_size;
        if data_size > format::MAX_SECTION_SIZE {
            return Err(EncodeError::SectionOverflow {
                section: Section::InitialData.name(),
            });
        }

        let roots = self.gc_root_slots();
        let roots_size = 2 * roots.len();
        self.section_layout
            .insert(Section::GcRoots.name(), (cursor, roots_size));
        cursor += roots_size;

        self.heap_offset = cursor;
        let gc_ids: Vec<AllocationId> = self.gc_order.iter().copied().collect();
        for id in gc_ids {
            let allocation = &self.info.allocations[&id];
            let size = allocation_payload_size(allocation)?;
            // Arrays carry their element count before the header word.
            if matches!(allocation, Allocation::Array(_)) {
                cursor += 2;
            }
            cursor += 2;
            let payload = cursor;
            cursor += size + (size & 1);
            if payload - self.heap_offset >= format::MAX_SECTION_SIZE {
                return Err(EncodeError::SectionOverflow {
                    section: Section::InitialHeap.name(),
                });
            }
            self.gc_offsets.insert(id, payload);
        }
        let heap_size = cursor - self.heap_offset;
        self.section_layout
            .insert(Section::InitialHeap.name(), (self.heap_offset, heap_size));

        if cursor > u16::MAX as usize {
            return Err(EncodeError::ImageTooLarge { size: cursor });
        }
        self.total_size = cursor;
        Ok(())
    }

    /// Reserve one ROM allocation (header word + payload, 2-aligned) and
    /// return the payload offset.
    fn place_rom(&mut self, cursor: &mut usize, size: usize) -> Result<usize, EncodeError> {
        if size > format::MAX_ALLOCATION_SIZE {
            return Err(EncodeError::AllocationTooLarge { size });
        }
        *cursor += 2;
        let payload = *cursor;
        if payload > 0x3FFF {
            return Err(EncodeError::SectionOverflow { section: "rom" });
        }
        *cursor += size + (size & 1);
        Ok(payload)
    }

    /// Byte offsets (within the data section) of global slots holding GC
    /// references.
    fn gc_root_slots(&self) -> Vec<u16> {
        self.info
            .globals
            .iter()
            .enumerate()
            .filter(|(_, (_, value))| matches!(value, Value::Reference(_)))
            .map(|(i, _)| (i * 2) as u16)
            .collect()
    }

    // =========================================================================
    // Writing
    // =========================================================================

    fn write(&mut self) -> Result<Vec<u8>, EncodeError> {
        let mut out = vec![0u8; self.total_size];

        // Fixed header fields.
        out[format::OFF_VERSION] = format::BYTECODE_VERSION;
        out[format::OFF_HEADER_SIZE] = format::HEADER_SIZE;
        put_u16(&mut out, format::OFF_BYTECODE_SIZE, self.total_size as u16);
        put_u16(
            &mut out,
            format::OFF_ENGINE_VERSION,
            format::REQUIRED_ENGINE_VERSION,
        );
        put_u32(
            &mut out,
            format::OFF_FEATURE_FLAGS,
            format::SUPPORTED_FEATURE_FLAGS,
        );
        let global_count = u16::try_from(self.info.globals.len())
            .map_err(|_| EncodeError::Unencodable("more than 65535 globals".into()))?;
        put_u16(&mut out, format::OFF_GLOBAL_COUNT, global_count);
        for section in Section::ALL {
            let (offset, size) = self.section_layout[section.name()];
            put_u16(&mut out, section.pair_offset(), offset as u16);
            put_u16(&mut out, section.pair_offset() + 2, size as u16);
        }

        // Import table.
        let (import_off, _) = self.section_layout[Section::ImportTable.name()];
        for (i, id) in self.host_ids.iter().enumerate() {
            put_u16(&mut out, import_off + 2 * i, *id);
        }

        // Export table.
        let (export_off, _) = self.section_layout[Section::ExportTable.name()];
        for (i, (id, value)) in self.info.exports.iter().enumerate() {
            put_u16(&mut out, export_off + 4 * i, *id);
            let encoded = self.encode_value(value)?;
            put_u16(&mut out, export_off + 4 * i + 2, encoded);
        }

        // String table: pointers in sorted order.
        let (table_off, _) = self.section_layout[Section::StringTable.name()];
        for (i, s) in self.strings.iter().enumerate() {
            let payload = self.string_offsets[s.as_str()];
            put_u16(&mut out, table_off + 2 * i, format::TAG_PGM | payload as u16);
        }

        // ROM allocations.
        for (id, payload) in self.function_offsets.clone() {
            let function = &self.info.functions[&id];
            let body = self.encode_function(function)?;
            put_u16(
                &mut out,
                payload - 2,
                format::allocation_header(TypeCode::Function, body.len()),
            );
            out[payload..payload + body.len()].copy_from_slice(&body);
        }
        for (s, payload) in self.string_offsets.clone() {
            put_u16(
                &mut out,
                payload - 2,
                format::allocation_header(TypeCode::String, s.len()),
            );
            out[payload..payload + s.len()].copy_from_slice(s.as_bytes());
        }
        for boxed in self.numbers.clone() {
            let payload = self.number_offsets[&boxed.bits];
            if boxed.is_int32 {
                let n = f64::from_bits(boxed.bits) as i32;
                put_u16(
                    &mut out,
                    payload - 2,
                    format::allocation_header(TypeCode::Int32, 4),
                );
                out[payload..payload + 4].copy_from_slice(&n.to_le_bytes());
            } else {
                put_u16(
                    &mut out,
                    payload - 2,
                    format::allocation_header(TypeCode::Float64, 8),
                );
                out[payload..payload + 8]
                    .copy_from_slice(&f64::from_bits(boxed.bits).to_le_bytes());
            }
        }
        for (i, id) in self.host_ids.clone().into_iter().enumerate() {
            let payload = self.host_offsets[&id];
            put_u16(
                &mut out,
                payload - 2,
                format::allocation_header(TypeCode::HostFunc, 2),
            );
            put_u16(&mut out, payload, i as u16);
        }

        // Globals.
        for (i, (_, value)) in self.info.globals.iter().enumerate() {
            let encoded = self.encode_value(value)?;
            put_u16(&mut out, self.data_offset + 2 * i, encoded);
        }

        // GC roots.
        let (roots_off, _) = self.section_layout[Section::GcRoots.name()];
        for (i, slot) in self.gc_root_slots().iter().enumerate() {
            put_u16(&mut out, roots_off + 2 * i, *slot);
        }

        // GC heap.
        for (id, payload) in self.gc_offsets.clone() {
            let allocation = &self.info.allocations[&id];
            match allocation {
                Allocation::Object(properties) => {
                    put_u16(
                        &mut out,
                        payload - 2,
                        format::allocation_header(TypeCode::Object, properties.len() * 4),
                    );
                    let entries: Vec<(String, Value)> = properties
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    for (i, (key, value)) in entries.iter().enumerate() {
                        let key_ptr = self.string_offsets.get(key.as_str()).ok_or_else(|| {
                            EncodeError::DanglingReference(format!("key '{}'", key))
                        })?;
                        put_u16(
                            &mut out,
                            payload + 4 * i,
                            format::TAG_PGM | *key_ptr as u16,
                        );
                        let encoded = self.encode_value(value)?;
                        put_u16(&mut out, payload + 4 * i + 2, encoded);
                    }
                }
                Allocation::Array(elements) => {
                    put_u16(&mut out, payload - 4, elements.len() as u16);
                    put_u16(
                        &mut out,
                        payload - 2,
                        format::allocation_header(TypeCode::Array, elements.len() * 2),
                    );
                    for (i, element) in elements.clone().iter().enumerate() {
                        let encoded = self.encode_value(element)?;
                        put_u16(&mut out, payload + 2 * i, encoded);
                    }
                }
                Allocation::Closure(slots) => {
                    put_u16(
                        &mut out,
                        payload - 2,
                        format::allocation_header(TypeCode::Closure, slots.len() * 2),
                    );
                    for (i, slot) in slots.clone().iter().enumerate() {
                        let encoded = self.encode_value(slot)?;
                        put_u16(&mut out, payload + 2 * i, encoded);
                    }
                }
            }
        }

        // Back-patch the checksum last.
        let crc = crate::crc::crc16_ccitt(&out[format::OFF_ENGINE_VERSION..]);
        put_u16(&mut out, format::OFF_CRC, crc);

        tracing::debug!(
            image = self.total_size,
            functions = self.function_offsets.len(),
            strings = self.string_offsets.len(),
            heap = self.gc_offsets.len(),
            "snapshot encoded"
        );
        Ok(out)
    }

    /// Serialize one value as a 16-bit word.
    fn encode_value(&self, value: &Value) -> Result<u16, EncodeError> {
        let encoded = match value {
            Value::Undefined => format::WK_UNDEFINED,
            Value::Null => format::WK_NULL,
            Value::Boolean(true) => format::WK_TRUE,
            Value::Boolean(false) => format::WK_FALSE,
            Value::Number(n) if n.is_nan() => format::WK_NAN,
            Value::Number(n) if *n == 0.0 && n.is_sign_negative() => format::WK_NEG_ZERO,
            Value::Number(n) => match value.as_inline_int() {
                Some(inline) => format::inline_int(inline),
                None => {
                    let payload = self.number_offsets.get(&n.to_bits()).ok_or_else(|| {
                        EncodeError::DanglingReference(format!("number {}", n))
                    })?;
                    format::TAG_PGM | *payload as u16
                }
            },
            Value::String(s) => {
                let payload = self.string_offsets.get(&**s).ok_or_else(|| {
                    EncodeError::DanglingReference(format!("string '{}'", s))
                })?;
                format::TAG_PGM | *payload as u16
            }
            Value::Reference(id) => {
                let payload = self.gc_offsets.get(id).ok_or_else(|| {
                    EncodeError::DanglingReference(format!("allocation {}", id))
                })?;
                format::TAG_GC | (payload - self.heap_offset) as u16
            }
            Value::Function(id) => {
                let payload = self.function_offsets.get(id).ok_or_else(|| {
                    EncodeError::DanglingReference(format!("function {}", id))
                })?;
                format::TAG_PGM | *payload as u16
            }
            Value::HostFunction(id) => {
                let payload = self.host_offsets.get(&id.0).ok_or_else(|| {
                    EncodeError::DanglingReference(format!("host function {}", id))
                })?;
                format::TAG_PGM | *payload as u16
            }
            Value::Ephemeral(_) => return Err(EncodeError::EphemeralInSnapshot),
        };
        Ok(encoded)
    }

    /// Serialize a function body per the opcode metadata table.
    fn encode_function(&self, function: &Function) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        out.push(u8::try_from(function.max_stack_depth).map_err(|_| {
            EncodeError::Unencodable("function max stack depth exceeds 255".into())
        })?);
        out.push(u8::try_from(function.blocks.len()).map_err(|_| {
            EncodeError::Unencodable("function has more than 255 blocks".into())
        })?);
        for block in function.blocks.values() {
            out.extend_from_slice(&block.id.0.to_le_bytes());
            out.push(u8::try_from(block.expected_stack_depth_at_entry).map_err(|_| {
                EncodeError::Unencodable("block entry depth exceeds 255".into())
            })?);
            out.extend_from_slice(&(block.operations.len() as u16).to_le_bytes());
            for op in &block.operations {
                out.push(format::opcode_byte(op.opcode));
                let meta = op.opcode.meta();
                for (schema, operand) in meta.operands.iter().zip(&op.operands) {
                    self.encode_operand(&mut out, *schema, operand)?;
                }
            }
        }
        Ok(out)
    }

    fn encode_operand(
        &self,
        out: &mut Vec<u8>,
        schema: OperandSchema,
        operand: &Operand,
    ) -> Result<(), EncodeError> {
        match (schema, operand) {
            (OperandSchema::Label, Operand::Label(id)) => {
                out.extend_from_slice(&id.0.to_le_bytes());
            }
            (OperandSchema::Count, Operand::Count(n)) => {
                out.extend_from_slice(&n.to_le_bytes());
            }
            (OperandSchema::Index, Operand::Index(i)) => {
                out.extend_from_slice(&i.to_le_bytes());
            }
            (OperandSchema::NameOrIndex, Operand::Name(name)) => {
                let index = self.global_index.get(name.as_str()).ok_or_else(|| {
                    EncodeError::Unencodable(format!("global '{}' is not present in the VM", name))
                })?;
                out.extend_from_slice(&index.to_le_bytes());
            }
            (OperandSchema::NameOrIndex, Operand::Index(i)) => {
                out.extend_from_slice(&i.to_le_bytes());
            }
            (OperandSchema::Literal, Operand::Literal(value)) => {
                let encoded = self.encode_value(value)?;
                out.extend_from_slice(&encoded.to_le_bytes());
            }
            (OperandSchema::Bin, Operand::Bin(op)) => out.push(format::bin_op_byte(*op)),
            (OperandSchema::Un, Operand::Un(op)) => out.push(format::un_op_byte(*op)),
            _ => {
                return Err(EncodeError::Unencodable(
                    "operand does not match its opcode schema".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Size of one function's encoded payload, without resolving any value.
fn function_payload_size(function: &Function) -> Result<usize, EncodeError> {
    let mut size = 2; // max stack depth + block count
    for block in function.blocks.values() {
        size += 5; // id + entry depth + op count
        for op in &block.operations {
            size += 1;
            for schema in op.opcode.meta().operands {
                size += match schema {
                    OperandSchema::Bin | OperandSchema::Un => 1,
                    _ => 2,
                };
            }
        }
    }
    if size > format::MAX_ALLOCATION_SIZE {
        return Err(EncodeError::AllocationTooLarge { size });
    }
    Ok(size)
}

fn allocation_payload_size(allocation: &Allocation) -> Result<usize, EncodeError> {
    let size = match allocation {
        Allocation::Object(properties) => properties.len() * 4,
        Allocation::Array(elements) => elements.len() * 2,
        Allocation::Closure(slots) => slots.len() * 2,
    };
    if size > format::MAX_ALLOCATION_SIZE {
        return Err(EncodeError::AllocationTooLarge { size });
    }
    Ok(size)
}

/// How a number value serializes when it cannot inline: `None` for inline
/// integers, NaN and negative zero (which have well-known encodings).
fn boxed_number(n: f64) -> Option<BoxedNumber> {
    if n.is_nan() || (n == 0.0 && n.is_sign_negative()) {
        return None;
    }
    if Value::Number(n).as_inline_int().is_some() {
        return None;
    }
    let is_int32 =
        n.is_finite() && n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64;
    Some(BoxedNumber {
        bits: n.to_bits(),
        is_int32,
    })
}

fn put_u16(out: &mut [u8], offset: usize, value: u16) {
    out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
