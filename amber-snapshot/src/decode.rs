// amber-snapshot - Snapshot image encoder/decoder for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Snapshot decoding: structural, not executing.
//!
//! After validating size, header shape, CRC and versions, the decoder walks
//! the image exactly the way the consumer VM would address it: through the
//! header's section pairs and then value by value through globals and
//! exports, following 16-bit logical addresses. Every visited field becomes
//! a component in the [`SnapshotMapping`]; cycles are broken by keying a
//! visited set on logical addresses. The result is both a pretty-printable
//! account of every byte and a [`SnapshotInfo`] a fresh VM can resume from.

use indexmap::IndexMap;

use amber_il::{
    AllocationId, Block, BlockId, Function, FunctionId, HostFunctionId, Operand, OperandSchema,
    Operation, Value,
};
use amber_vm::{Allocation, SnapshotInfo};

use crate::crc::crc16_ccitt;
use crate::error::InvalidBytecode;
use crate::format::{self, Section, TypeCode};
use crate::mapping::{Component, ComponentKind, Region, SnapshotMapping};

/// Decode and validate a snapshot image.
pub fn decode_snapshot(bytes: &[u8]) -> Result<(SnapshotInfo, SnapshotMapping), InvalidBytecode> {
    let mut decoder = Decoder::new(bytes);
    decoder.validate()?;
    decoder.read_header()?;
    decoder.read_tables()?;
    decoder.read_globals()?;
    decoder.read_gc_roots()?;
    decoder.finish()
}

struct Decoder<'a> {
    bytes: &'a [u8],
    mapping: SnapshotMapping,
    sections: IndexMap<&'static str, (usize, usize)>,
    import_ids: Vec<HostFunctionId>,
    exports: IndexMap<u16, Value>,
    globals: Vec<(String, Value)>,

    // Visited sets, keyed by payload offset.
    gc_by_offset: IndexMap<usize, AllocationId>,
    allocations: IndexMap<AllocationId, Allocation>,
    rom_values: IndexMap<usize, Value>,
    functions_by_offset: IndexMap<usize, FunctionId>,
    functions: IndexMap<FunctionId, Function>,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            mapping: SnapshotMapping::new(),
            sections: IndexMap::new(),
            import_ids: Vec::new(),
            exports: IndexMap::new(),
            globals: Vec::new(),
            gc_by_offset: IndexMap::new(),
            allocations: IndexMap::new(),
            rom_values: IndexMap::new(),
            functions_by_offset: IndexMap::new(),
            functions: IndexMap::new(),
        }
    }

    // =========================================================================
    // Validation and header
    // =========================================================================

    fn validate(&self) -> Result<(), InvalidBytecode> {
        if self.bytes.len() < format::HEADER_SIZE as usize {
            return Err(InvalidBytecode::Truncated {
                at: self.bytes.len(),
            });
        }
        let declared_size = self.read_u16_at(format::OFF_BYTECODE_SIZE)?;
        if declared_size as usize != self.bytes.len() {
            return Err(InvalidBytecode::SizeMismatch {
                declared: declared_size,
                actual: self.bytes.len(),
            });
        }
        let header_size = self.bytes[format::OFF_HEADER_SIZE];
        if header_size != format::HEADER_SIZE {
            return Err(InvalidBytecode::HeaderSizeMismatch {
                declared: header_size,
                expected: format::HEADER_SIZE,
            });
        }
        let stored_crc = self.read_u16_at(format::OFF_CRC)?;
        let actual_crc = crc16_ccitt(&self.bytes[format::OFF_ENGINE_VERSION..]);
        if stored_crc != actual_crc {
            return Err(InvalidBytecode::CrcMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }
        let version = self.bytes[format::OFF_VERSION];
        if version != format::BYTECODE_VERSION {
            return Err(InvalidBytecode::VersionMismatch {
                field: "bytecode version",
                declared: version as u32,
                supported: format::BYTECODE_VERSION as u32,
            });
        }
        let engine = self.read_u16_at(format::OFF_ENGINE_VERSION)?;
        if engine != format::REQUIRED_ENGINE_VERSION {
            return Err(InvalidBytecode::VersionMismatch {
                field: "engine version",
                declared: engine as u32,
                supported: format::REQUIRED_ENGINE_VERSION as u32,
            });
        }
        let features = self.read_u32_at(format::OFF_FEATURE_FLAGS)?;
        if features & !format::SUPPORTED_FEATURE_FLAGS != 0 {
            return Err(InvalidBytecode::FeatureMismatch {
                declared: features,
                supported: format::SUPPORTED_FEATURE_FLAGS,
            });
        }
        Ok(())
    }

    fn read_header(&mut self) -> Result<(), InvalidBytecode> {
        self.header_field(format::OFF_VERSION, 1, "bytecodeVersion");
        self.header_field(format::OFF_HEADER_SIZE, 1, "headerSize");
        self.header_field(format::OFF_BYTECODE_SIZE, 2, "bytecodeSize");
        self.header_field(format::OFF_CRC, 2, "expectedCRC");
        self.header_field(format::OFF_ENGINE_VERSION, 2, "requiredEngineVersion");
        self.header_field(format::OFF_FEATURE_FLAGS, 4, "requiredFeatureFlags");
        self.header_field(format::OFF_GLOBAL_COUNT, 2, "globalVariableCount");
        for section in Section::ALL {
            let offset = self.read_u16_at(section.pair_offset())? as usize;
            let size = self.read_u16_at(section.pair_offset() + 2)? as usize;
            if offset + size > self.bytes.len() {
                return Err(InvalidBytecode::Malformed(format!(
                    "section {} [{:#06x}+{}] exceeds the image",
                    section.name(),
                    offset,
                    size
                )));
            }
            self.sections.insert(section.name(), (offset, size));
            self.header_field(
                section.pair_offset(),
                4,
                format!("{} {{offset: {:#06x}, size: {}}}", section.name(), offset, size),
            );
        }
        Ok(())
    }

    fn header_field(&mut self, offset: usize, size: usize, label: impl Into<String>) {
        let bytes = &self.bytes[offset..offset + size];
        self.mapping
            .push_field(Region::Header, offset, bytes, None, label);
    }

    fn section(&self, section: Section) -> (usize, usize) {
        self.sections[section.name()]
    }

    // =========================================================================
    // Tables
    // =========================================================================

    fn read_tables(&mut self) -> Result<(), InvalidBytecode> {
        let (import_off, import_size) = self.section(Section::ImportTable);
        if import_size % 2 != 0 {
            return Err(InvalidBytecode::Malformed("odd import table size".into()));
        }
        for i in 0..import_size / 2 {
            let id = self.read_u16_at(import_off + 2 * i)?;
            self.mapping.push_field(
                Region::ImportTable,
                import_off + 2 * i,
                &self.bytes[import_off + 2 * i..import_off + 2 * i + 2],
                None,
                format!("[{}] host function {}", i, id),
            );
            self.import_ids.push(HostFunctionId(id));
        }

        let (short_off, short_size) = self.section(Section::ShortCallTable);
        if short_size != 0 {
            self.mapping.push_field(
                Region::ShortCallTable,
                short_off,
                &self.bytes[short_off..short_off + short_size],
                None,
                "short-call table (reserved)",
            );
        }

        let (table_off, table_size) = self.section(Section::StringTable);
        if table_size % 2 != 0 {
            return Err(InvalidBytecode::Malformed("odd string table size".into()));
        }
        for i in 0..table_size / 2 {
            let raw = self.read_u16_at(table_off + 2 * i)?;
            let value = self.decode_value(raw)?;
            let label = match &value {
                Value::String(s) => format!("[{}] \"{}\"", i, s),
                _ => {
                    return Err(InvalidBytecode::Malformed(
                        "string table entry does not point at a string".into(),
                    ));
                }
            };
            self.mapping.push_field(
                Region::StringTable,
                table_off + 2 * i,
                &self.bytes[table_off + 2 * i..table_off + 2 * i + 2],
                Some(raw),
                label,
            );
        }

        let (export_off, export_size) = self.section(Section::ExportTable);
        if export_size % 4 != 0 {
            return Err(InvalidBytecode::Malformed("odd export table size".into()));
        }
        for i in 0..export_size / 4 {
            let id = self.read_u16_at(export_off + 4 * i)?;
            let raw = self.read_u16_at(export_off + 4 * i + 2)?;
            let value = self.decode_value(raw)?;
            self.mapping.push_field(
                Region::ExportTable,
                export_off + 4 * i,
                &self.bytes[export_off + 4 * i..export_off + 4 * i + 4],
                None,
                format!("export {} -> {:#06x}", id, raw),
            );
            self.exports.insert(id, value);
        }
        Ok(())
    }

    fn read_globals(&mut self) -> Result<(), InvalidBytecode> {
        let count = self.read_u16_at(format::OFF_GLOBAL_COUNT)? as usize;
        let (data_off, data_size) = self.section(Section::InitialData);
        if data_size != count * 2 {
            return Err(InvalidBytecode::Malformed(format!(
                "initialData holds {} bytes for {} globals",
                data_size, count
            )));
        }
        for i in 0..count {
            let raw = self.read_u16_at(data_off + 2 * i)?;
            let value = self.decode_value(raw)?;
            self.mapping.push_field(
                Region::Globals,
                data_off + 2 * i,
                &self.bytes[data_off + 2 * i..data_off + 2 * i + 2],
                Some(format::TAG_DATA | (2 * i) as u16),
                format!("[{}]", i),
            );
            self.globals.push((format!("g{}", i), value));
        }
        Ok(())
    }

    fn read_gc_roots(&mut self) -> Result<(), InvalidBytecode> {
        let (roots_off, roots_size) = self.section(Section::GcRoots);
        if roots_size % 2 != 0 {
            return Err(InvalidBytecode::Malformed("odd gc roots size".into()));
        }
        let (_, data_size) = self.section(Section::InitialData);
        for i in 0..roots_size / 2 {
            let slot = self.read_u16_at(roots_off + 2 * i)?;
            if slot as usize >= data_size {
                return Err(InvalidBytecode::Malformed(format!(
                    "gc root {} points outside initialData",
                    slot
                )));
            }
            self.mapping.push_field(
                Region::GcRoots,
                roots_off + 2 * i,
                &self.bytes[roots_off + 2 * i..roots_off + 2 * i + 2],
                None,
                format!("root -> data[{}]", slot / 2),
            );
        }
        Ok(())
    }

    // =========================================================================
    // Values and allocations
    // =========================================================================

    fn decode_value(&mut self, raw: u16) -> Result<Value, InvalidBytecode> {
        if raw < format::TAG_GC {
            return Ok(Value::Number(format::decode_inline_int(raw) as f64));
        }
        if raw < format::TAG_DATA {
            let (heap_off, heap_size) = self.section(Section::InitialHeap);
            let relative = (raw - format::TAG_GC) as usize;
            if relative >= heap_size {
                return Err(InvalidBytecode::Malformed(format!(
                    "gc pointer {:#06x} outside initialHeap",
                    raw
                )));
            }
            let id = self.visit_gc_allocation(heap_off + relative, raw)?;
            return Ok(Value::Reference(id));
        }
        if raw < format::TAG_PGM {
            return Err(InvalidBytecode::Malformed(format!(
                "data-section pointer {:#06x} in value position",
                raw
            )));
        }
        match raw {
            format::WK_UNDEFINED => Ok(Value::Undefined),
            format::WK_NULL => Ok(Value::Null),
            format::WK_TRUE => Ok(Value::Boolean(true)),
            format::WK_FALSE => Ok(Value::Boolean(false)),
            format::WK_NAN => Ok(Value::Number(f64::NAN)),
            format::WK_NEG_ZERO => Ok(Value::Number(-0.0)),
            _ => self.visit_rom_allocation((raw - format::TAG_PGM) as usize, raw),
        }
    }

    /// Read an allocation header word at `payload - 2`.
    fn allocation_header(&self, payload: usize) -> Result<(TypeCode, usize), InvalidBytecode> {
        if payload < 2 {
            return Err(InvalidBytecode::Malformed(
                "allocation pointer into the header".into(),
            ));
        }
        let word = self.read_u16_at(payload - 2)?;
        let (code, size) = format::split_allocation_header(word);
        let type_code = TypeCode::from_u16(code).ok_or_else(|| {
            InvalidBytecode::Malformed(format!("unknown allocation type code {}", code))
        })?;
        if payload + size > self.bytes.len() {
            return Err(InvalidBytecode::Truncated {
                at: payload + size,
            });
        }
        Ok((type_code, size))
    }

    fn visit_rom_allocation(
        &mut self,
        payload: usize,
        logical: u16,
    ) -> Result<Value, InvalidBytecode> {
        if let Some(value) = self.rom_values.get(&payload) {
            return Ok(value.clone());
        }
        if let Some(function) = self.functions_by_offset.get(&payload) {
            return Ok(Value::Function(*function));
        }
        let (type_code, size) = self.allocation_header(payload)?;
        let content = &self.bytes[payload - 2..payload + size];
        let value = match type_code {
            TypeCode::String => {
                let text = std::str::from_utf8(&self.bytes[payload..payload + size])
                    .map_err(|_| InvalidBytecode::Malformed("string is not UTF-8".into()))?;
                let value = Value::string(text);
                self.mapping.push(Component {
                    offset: payload - 2,
                    size: size + 2,
                    logical_address: Some(logical),
                    region: Region::Rom,
                    kind: ComponentKind::Allocation,
                    label: format!("String \"{}\"", text),
                    content: content.to_vec(),
                });
                value
            }
            TypeCode::Int32 => {
                if size != 4 {
                    return Err(InvalidBytecode::Malformed("Int32 box of wrong size".into()));
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&self.bytes[payload..payload + 4]);
                let n = i32::from_le_bytes(raw);
                self.mapping.push(Component {
                    offset: payload - 2,
                    size: size + 2,
                    logical_address: Some(logical),
                    region: Region::Rom,
                    kind: ComponentKind::Allocation,
                    label: format!("Int32({})", n),
                    content: content.to_vec(),
                });
                Value::Number(n as f64)
            }
            TypeCode::Float64 => {
                if size != 8 {
                    return Err(InvalidBytecode::Malformed(
                        "Float64 box of wrong size".into(),
                    ));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.bytes[payload..payload + 8]);
                let n = f64::from_le_bytes(raw);
                self.mapping.push(Component {
                    offset: payload - 2,
                    size: size + 2,
                    logical_address: Some(logical),
                    region: Region::Rom,
                    kind: ComponentKind::Allocation,
                    label: format!("Float64({})", n),
                    content: content.to_vec(),
                });
                Value::Number(n)
            }
            TypeCode::HostFunc => {
                if size != 2 {
                    return Err(InvalidBytecode::Malformed(
                        "HostFunc box of wrong size".into(),
                    ));
                }
                let index = self.read_u16_at(payload)? as usize;
                let id = *self.import_ids.get(index).ok_or_else(|| {
                    InvalidBytecode::Malformed(format!(
                        "host function index {} outside the import table",
                        index
                    ))
                })?;
                self.mapping.push(Component {
                    offset: payload - 2,
                    size: size + 2,
                    logical_address: Some(logical),
                    region: Region::Rom,
                    kind: ComponentKind::Allocation,
                    label: format!("HostFunc(import[{}] = {})", index, id),
                    content: content.to_vec(),
                });
                Value::HostFunction(id)
            }
            TypeCode::Function => {
                return self.visit_function(payload, size, logical);
            }
            other => {
                return Err(InvalidBytecode::Malformed(format!(
                    "unexpected {} allocation in rom",
                    other.name()
                )));
            }
        };
        self.rom_values.insert(payload, value.clone());
        Ok(value)
    }

    fn visit_gc_allocation(
        &mut self,
        payload: usize,
        logical: u16,
    ) -> Result<AllocationId, InvalidBytecode> {
        if let Some(id) = self.gc_by_offset.get(&payload) {
            return Ok(*id);
        }
        let (type_code, size) = self.allocation_header(payload)?;
        let id = AllocationId(self.allocations.len() as u32);
        // Reserve the id before recursing so cycles resolve to it.
        self.gc_by_offset.insert(payload, id);
        self.allocations
            .insert(id, Allocation::Object(IndexMap::new()));

        let allocation = match type_code {
            TypeCode::Object => {
                if size % 4 != 0 {
                    return Err(InvalidBytecode::Malformed(
                        "object payload not a multiple of 4".into(),
                    ));
                }
                let mut properties = IndexMap::new();
                for i in 0..size / 4 {
                    let key_raw = self.read_u16_at(payload + 4 * i)?;
                    let key = match self.decode_value(key_raw)? {
                        Value::String(s) => s.to_string(),
                        _ => {
                            return Err(InvalidBytecode::Malformed(
                                "object key is not a string".into(),
                            ));
                        }
                    };
                    let value_raw = self.read_u16_at(payload + 4 * i + 2)?;
                    let value = self.decode_value(value_raw)?;
                    properties.insert(key, value);
                }
                Allocation::Object(properties)
            }
            TypeCode::Array => {
                if payload < 4 {
                    return Err(InvalidBytecode::Malformed(
                        "array pointer into the header".into(),
                    ));
                }
                let length = self.read_u16_at(payload - 4)? as usize;
                if size != length * 2 {
                    return Err(InvalidBytecode::Malformed(format!(
                        "array length {} does not match payload size {}",
                        length, size
                    )));
                }
                let mut elements = Vec::with_capacity(length);
                for i in 0..length {
                    let raw = self.read_u16_at(payload + 2 * i)?;
                    elements.push(self.decode_value(raw)?);
                }
                Allocation::Array(elements)
            }
            TypeCode::Closure => {
                if size % 2 != 0 {
                    return Err(InvalidBytecode::Malformed("odd closure payload".into()));
                }
                let mut slots = Vec::with_capacity(size / 2);
                for i in 0..size / 2 {
                    let raw = self.read_u16_at(payload + 2 * i)?;
                    slots.push(self.decode_value(raw)?);
                }
                Allocation::Closure(slots)
            }
            other => {
                return Err(InvalidBytecode::Malformed(format!(
                    "unexpected {} allocation in the gc heap",
                    other.name()
                )));
            }
        };

        let prefix = if matches!(allocation, Allocation::Array(_)) {
            4
        } else {
            2
        };
        self.mapping.push(Component {
            offset: payload - prefix,
            size: size + prefix,
            logical_address: Some(logical),
            region: Region::GcHeap,
            kind: ComponentKind::Allocation,
            label: format!("Allocation({} {})", type_code.name(), id),
            content: self.bytes[payload - prefix..payload + size].to_vec(),
        });
        self.allocations.insert(id, allocation);
        Ok(id)
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn visit_function(
        &mut self,
        payload: usize,
        size: usize,
        logical: u16,
    ) -> Result<Value, InvalidBytecode> {
        let id = FunctionId(self.functions.len() as u16);
        // Reserve before parsing: a function literal may point back here.
        self.functions_by_offset.insert(payload, id);

        let mut reader = Reader::new(self.bytes, payload, payload + size);
        let max_stack_depth = reader.u8()? as u16;
        let block_count = reader.u8()? as usize;
        let mut blocks = IndexMap::new();
        let mut entry_block_id = None;
        for _ in 0..block_count {
            let block_id = BlockId(reader.u16()?);
            let expected = reader.u8()? as u16;
            let op_count = reader.u16()? as usize;
            let mut operations = Vec::with_capacity(op_count);
            let mut depth = expected;
            for _ in 0..op_count {
                let opcode = format::byte_opcode(reader.u8()?).ok_or_else(|| {
                    InvalidBytecode::Malformed("unknown opcode byte".into())
                })?;
                let mut operands = Vec::new();
                for schema in opcode.meta().operands {
                    let operand = match schema {
                        OperandSchema::Label => Operand::Label(BlockId(reader.u16()?)),
                        OperandSchema::Count => Operand::Count(reader.u16()?),
                        OperandSchema::Index | OperandSchema::NameOrIndex => {
                            Operand::Index(reader.u16()?)
                        }
                        OperandSchema::Literal => {
                            let raw = reader.u16()?;
                            // Literals may reference further ROM allocations.
                            Operand::Literal(self.decode_value(raw)?)
                        }
                        OperandSchema::Bin => Operand::Bin(
                            format::byte_bin_op(reader.u8()?).ok_or_else(|| {
                                InvalidBytecode::Malformed("unknown binary operator byte".into())
                            })?,
                        ),
                        OperandSchema::Un => Operand::Un(
                            format::byte_un_op(reader.u8()?).ok_or_else(|| {
                                InvalidBytecode::Malformed("unknown unary operator byte".into())
                            })?,
                        ),
                    };
                    operands.push(operand);
                }
                let before = depth;
                let after = before as i32 + opcode.stack_delta(&operands);
                if after < 0 {
                    return Err(InvalidBytecode::Malformed(format!(
                        "{} underflows the stack in {}",
                        opcode, block_id
                    )));
                }
                depth = after as u16;
                operations.push(Operation {
                    opcode,
                    operands,
                    stack_depth_before: before,
                    stack_depth_after: depth,
                    loc: None,
                });
            }
            entry_block_id.get_or_insert(block_id);
            blocks.insert(
                block_id,
                Block {
                    id: block_id,
                    expected_stack_depth_at_entry: expected,
                    operations,
                },
            );
        }
        let entry_block_id = entry_block_id
            .ok_or_else(|| InvalidBytecode::Malformed("function with no blocks".into()))?;

        self.mapping.push(Component {
            offset: payload - 2,
            size: size + 2,
            logical_address: Some(logical),
            region: Region::Rom,
            kind: ComponentKind::Allocation,
            label: format!("Function {}", id),
            content: self.bytes[payload - 2..payload + size].to_vec(),
        });
        self.functions.insert(
            id,
            Function {
                id,
                name: None,
                entry_block_id,
                max_stack_depth,
                blocks,
            },
        );
        Ok(Value::Function(id))
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    fn finish(mut self) -> Result<(SnapshotInfo, SnapshotMapping), InvalidBytecode> {
        self.mapping.finalize(self.bytes);
        let info = SnapshotInfo {
            globals: self.globals,
            allocations: self.allocations,
            functions: self.functions,
            exports: self.exports,
        };
        tracing::debug!(
            globals = info.globals.len(),
            functions = info.functions.len(),
            heap = info.allocations.len(),
            "snapshot decoded"
        );
        Ok((info, self.mapping))
    }

    fn read_u16_at(&self, offset: usize) -> Result<u16, InvalidBytecode> {
        let bytes = self
            .bytes
            .get(offset..offset + 2)
            .ok_or(InvalidBytecode::Truncated { at: offset })?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32_at(&self, offset: usize) -> Result<u32, InvalidBytecode> {
        let bytes = self
            .bytes
            .get(offset..offset + 4)
            .ok_or(InvalidBytecode::Truncated { at: offset })?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Bounds-checked little-endian reader over one allocation's payload.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], start: usize, end: usize) -> Self {
        Self {
            bytes,
            pos: start,
            end,
        }
    }

    fn u8(&mut self) -> Result<u8, InvalidBytecode> {
        if self.pos >= self.end {
            return Err(InvalidBytecode::Truncated { at: self.pos });
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, InvalidBytecode> {
        if self.pos + 2 > self.end {
            return Err(InvalidBytecode::Truncated { at: self.pos });
        }
        let value = u16::from_le_bytes([self.bytes[self.pos], self.bytes[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }
}
