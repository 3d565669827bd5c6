//! Class-file parsing.
//!
//! Produces a fully resolved [`ClassNode`]: constant pool indirection is
//! flattened away and method bytecode is decoded into the label-anchored
//! instruction list. Unknown attributes are skipped by length rather than
//! rejected, since obfuscators plant garbage attributes on purpose.

mod code;
#[cfg(test)]
mod test;

use crate::access::{ClassAccess, FieldAccess, MethodAccess};
use crate::class::{ClassNode, ClassVersion, FieldNode, MethodNode};
use crate::insn::{ConstOperand, Handle, HandleKind};
use crate::{IrError, Result};

/// Parses a single class file.
pub fn parse_class(bytes: &[u8]) -> Result<ClassNode> {
    let mut data = Data::new(bytes);
    let magic = data.u4()?;
    if magic != 0xCAFE_BABE {
        return Err(IrError::BadMagic { magic });
    }
    let minor = data.u2()?;
    let major = data.u2()?;
    let pool = Pool::parse(&mut data)?;

    let access = ClassAccess::from_bits_retain(data.u2()?);
    let name = pool.class_name(data.u2()?)?.to_string();
    let super_name = match data.u2()? {
        0 => None,
        index => Some(pool.class_name(index)?.to_string()),
    };
    let interface_count = data.u2()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(data.u2()?)?.to_string());
    }

    let field_count = data.u2()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(parse_field(&mut data, &pool)?);
    }

    let method_count = data.u2()?;
    let mut raw_methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        raw_methods.push(parse_method(&mut data, &pool)?);
    }

    let mut source_file = None;
    let mut bootstrap_methods = Vec::new();
    let attr_count = data.u2()?;
    for _ in 0..attr_count {
        let attr_name = pool.utf8(data.u2()?)?.to_string();
        let len = data.u4()? as usize;
        let end = data.pointer + len;
        match attr_name.as_str() {
            "SourceFile" => source_file = Some(pool.utf8(data.u2()?)?.to_string()),
            "BootstrapMethods" => {
                let count = data.u2()?;
                for _ in 0..count {
                    let handle = pool.handle(data.u2()?)?;
                    let arg_count = data.u2()?;
                    let mut args = Vec::with_capacity(arg_count as usize);
                    for _ in 0..arg_count {
                        args.push(pool.loadable(data.u2()?)?);
                    }
                    bootstrap_methods.push(BootstrapMethod { handle, args });
                }
            }
            _ => {}
        }
        data.seek(end)?;
    }

    let mut methods = Vec::with_capacity(raw_methods.len());
    for (mut method, raw_code) in raw_methods {
        if let Some(raw) = raw_code {
            code::decode(&mut method, &raw, &pool, &bootstrap_methods)?;
        }
        methods.push(method);
    }

    Ok(ClassNode {
        version: ClassVersion { minor, major },
        access,
        name,
        super_name,
        interfaces,
        fields,
        methods,
        source_file,
    })
}

/// One entry of the class's `BootstrapMethods` attribute.
pub(super) struct BootstrapMethod {
    pub(super) handle: Handle,
    pub(super) args: Vec<ConstOperand>,
}

fn parse_field(data: &mut Data, pool: &Pool) -> Result<FieldNode> {
    let access = FieldAccess::from_bits_retain(data.u2()?);
    let name = pool.utf8(data.u2()?)?.to_string();
    let desc = pool.utf8(data.u2()?)?.to_string();
    let mut signature = None;
    let mut value = None;
    let attr_count = data.u2()?;
    for _ in 0..attr_count {
        let attr_name = pool.utf8(data.u2()?)?.to_string();
        let len = data.u4()? as usize;
        let end = data.pointer + len;
        match attr_name.as_str() {
            "ConstantValue" => value = Some(pool.loadable(data.u2()?)?),
            "Signature" => signature = Some(pool.utf8(data.u2()?)?.to_string()),
            _ => {}
        }
        data.seek(end)?;
    }
    Ok(FieldNode {
        access,
        name,
        desc,
        signature,
        value,
    })
}

pub(super) struct RawException {
    pub(super) start: u16,
    pub(super) end: u16,
    pub(super) handler: u16,
    pub(super) catch_type: Option<String>,
}

pub(super) struct RawVar {
    pub(super) name: String,
    pub(super) desc: String,
    pub(super) start: u16,
    pub(super) len: u16,
    pub(super) index: u16,
}

pub(super) struct RawCode {
    pub(super) max_stack: u16,
    pub(super) max_locals: u16,
    pub(super) code: Vec<u8>,
    pub(super) exceptions: Vec<RawException>,
    pub(super) lines: Vec<(u16, u16)>,
    pub(super) vars: Vec<RawVar>,
}

fn parse_method(data: &mut Data, pool: &Pool) -> Result<(MethodNode, Option<RawCode>)> {
    let access = MethodAccess::from_bits_retain(data.u2()?);
    let name = pool.utf8(data.u2()?)?.to_string();
    let desc = pool.utf8(data.u2()?)?.to_string();
    let mut method = MethodNode::new(access, name, desc);
    let mut raw_code = None;

    let attr_count = data.u2()?;
    for _ in 0..attr_count {
        let attr_name = pool.utf8(data.u2()?)?.to_string();
        let len = data.u4()? as usize;
        let end = data.pointer + len;
        match attr_name.as_str() {
            "Code" => raw_code = Some(parse_code(data, pool)?),
            "Exceptions" => {
                let count = data.u2()?;
                for _ in 0..count {
                    method.exceptions.push(pool.class_name(data.u2()?)?.to_string());
                }
            }
            "Signature" => method.signature = Some(pool.utf8(data.u2()?)?.to_string()),
            _ => {}
        }
        data.seek(end)?;
    }
    Ok((method, raw_code))
}

fn parse_code(data: &mut Data, pool: &Pool) -> Result<RawCode> {
    let max_stack = data.u2()?;
    let max_locals = data.u2()?;
    let code_len = data.u4()? as usize;
    let code = data.bytes(code_len)?.to_vec();

    let exc_count = data.u2()?;
    let mut exceptions = Vec::with_capacity(exc_count as usize);
    for _ in 0..exc_count {
        exceptions.push(RawException {
            start: data.u2()?,
            end: data.u2()?,
            handler: data.u2()?,
            catch_type: match data.u2()? {
                0 => None,
                index => Some(pool.class_name(index)?.to_string()),
            },
        });
    }

    let mut lines = Vec::new();
    let mut vars = Vec::new();
    let attr_count = data.u2()?;
    for _ in 0..attr_count {
        let attr_name = pool.utf8(data.u2()?)?.to_string();
        let len = data.u4()? as usize;
        let end = data.pointer + len;
        match attr_name.as_str() {
            "LineNumberTable" => {
                let count = data.u2()?;
                for _ in 0..count {
                    lines.push((data.u2()?, data.u2()?));
                }
            }
            "LocalVariableTable" => {
                let count = data.u2()?;
                for _ in 0..count {
                    let start = data.u2()?;
                    let len = data.u2()?;
                    vars.push(RawVar {
                        start,
                        len,
                        name: pool.utf8(data.u2()?)?.to_string(),
                        desc: pool.utf8(data.u2()?)?.to_string(),
                        index: data.u2()?,
                    });
                }
            }
            _ => {}
        }
        data.seek(end)?;
    }

    Ok(RawCode {
        max_stack,
        max_locals,
        code,
        exceptions,
        lines,
        vars,
    })
}

/// Cursor over the raw class bytes.
pub(super) struct Data<'a> {
    data: &'a [u8],
    pub(super) pointer: usize,
}

impl<'a> Data<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Data { data, pointer: 0 }
    }

    fn eof(&self) -> IrError {
        IrError::UnexpectedEof {
            offset: self.pointer,
        }
    }

    pub(super) fn u1(&mut self) -> Result<u8> {
        let item = self.data.get(self.pointer).copied().ok_or_else(|| self.eof())?;
        self.pointer += 1;
        Ok(item)
    }

    pub(super) fn u2(&mut self) -> Result<u16> {
        Ok(((self.u1()? as u16) << 8) | self.u1()? as u16)
    }

    pub(super) fn u4(&mut self) -> Result<u32> {
        Ok(((self.u2()? as u32) << 16) | self.u2()? as u32)
    }

    pub(super) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pointer.checked_add(len).ok_or_else(|| self.eof())?;
        let slice = self.data.get(self.pointer..end).ok_or_else(|| self.eof())?;
        self.pointer = end;
        Ok(slice)
    }

    fn seek(&mut self, to: usize) -> Result<()> {
        if to > self.data.len() {
            return Err(self.eof());
        }
        self.pointer = to;
        Ok(())
    }
}

/// A constant pool entry, structurally parsed but not yet resolved.
enum CpEntry {
    Utf8(String),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    Str { string_index: u16 },
    MemberRef { class_index: u16, nat_index: u16 },
    NameAndType { name_index: u16, desc_index: u16 },
    MethodHandle { kind: u8, ref_index: u16 },
    MethodType { desc_index: u16 },
    Dynamic,
    InvokeDynamic { bsm_index: u16, nat_index: u16 },
    Module,
    Package,
    /// Second slot of a long or double entry.
    Reserved,
}

/// The resolved constant pool. Indexed from 1, as in the format.
pub(super) struct Pool {
    entries: Vec<CpEntry>,
}

impl Pool {
    fn parse(data: &mut Data) -> Result<Self> {
        let count = data.u2()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(CpEntry::Reserved); // index 0 is unused
        while entries.len() < count as usize {
            let tag = data.u1()?;
            let entry = match tag {
                1 => {
                    let len = data.u2()? as usize;
                    let index = entries.len() as u16;
                    CpEntry::Utf8(decode_mutf8(data.bytes(len)?).ok_or(IrError::BadUtf8 { index })?)
                }
                3 => CpEntry::Int(data.u4()? as i32),
                4 => CpEntry::Float(f32::from_bits(data.u4()?)),
                5 => CpEntry::Long((((data.u4()? as u64) << 32) | data.u4()? as u64) as i64),
                6 => CpEntry::Double(f64::from_bits(((data.u4()? as u64) << 32) | data.u4()? as u64)),
                7 => CpEntry::Class {
                    name_index: data.u2()?,
                },
                8 => CpEntry::Str {
                    string_index: data.u2()?,
                },
                9 | 10 | 11 => CpEntry::MemberRef {
                    class_index: data.u2()?,
                    nat_index: data.u2()?,
                },
                12 => CpEntry::NameAndType {
                    name_index: data.u2()?,
                    desc_index: data.u2()?,
                },
                15 => CpEntry::MethodHandle {
                    kind: data.u1()?,
                    ref_index: data.u2()?,
                },
                16 => CpEntry::MethodType {
                    desc_index: data.u2()?,
                },
                17 => {
                    data.u2()?;
                    data.u2()?;
                    CpEntry::Dynamic
                }
                18 => CpEntry::InvokeDynamic {
                    bsm_index: data.u2()?,
                    nat_index: data.u2()?,
                },
                19 => {
                    data.u2()?;
                    CpEntry::Module
                }
                20 => {
                    data.u2()?;
                    CpEntry::Package
                }
                tag => return Err(IrError::BadCpTag { tag }),
            };
            let two_slots = matches!(entry, CpEntry::Long(_) | CpEntry::Double(_));
            entries.push(entry);
            if two_slots {
                entries.push(CpEntry::Reserved);
            }
        }
        Ok(Self { entries })
    }

    fn entry(&self, index: u16) -> Result<&CpEntry> {
        match self.entries.get(index as usize) {
            Some(CpEntry::Reserved) | None => Err(IrError::BadCpIndex { index }),
            Some(entry) => Ok(entry),
        }
    }

    pub(super) fn utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CpEntry::Utf8(s) => Ok(s),
            _ => Err(IrError::BadCpType {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub(super) fn class_name(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CpEntry::Class { name_index } => self.utf8(*name_index),
            _ => Err(IrError::BadCpType {
                index,
                expected: "Class",
            }),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.entry(index)? {
            CpEntry::NameAndType {
                name_index,
                desc_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*desc_index)?)),
            _ => Err(IrError::BadCpType {
                index,
                expected: "NameAndType",
            }),
        }
    }

    /// Resolves a field, method or interface-method reference.
    pub(super) fn member_ref(&self, index: u16) -> Result<(String, String, String)> {
        match self.entry(index)? {
            CpEntry::MemberRef {
                class_index,
                nat_index,
            } => {
                let owner = self.class_name(*class_index)?.to_string();
                let (name, desc) = self.name_and_type(*nat_index)?;
                Ok((owner, name.to_string(), desc.to_string()))
            }
            _ => Err(IrError::BadCpType {
                index,
                expected: "member reference",
            }),
        }
    }

    pub(super) fn handle(&self, index: u16) -> Result<Handle> {
        match self.entry(index)? {
            CpEntry::MethodHandle { kind, ref_index } => {
                let (owner, name, desc) = self.member_ref(*ref_index)?;
                Ok(Handle {
                    kind: HandleKind::from_tag(*kind)?,
                    owner,
                    name,
                    desc,
                })
            }
            _ => Err(IrError::BadCpType {
                index,
                expected: "MethodHandle",
            }),
        }
    }

    pub(super) fn invoke_dynamic(&self, index: u16) -> Result<(u16, String, String)> {
        match self.entry(index)? {
            CpEntry::InvokeDynamic {
                bsm_index,
                nat_index,
            } => {
                let (name, desc) = self.name_and_type(*nat_index)?;
                Ok((*bsm_index, name.to_string(), desc.to_string()))
            }
            _ => Err(IrError::BadCpType {
                index,
                expected: "InvokeDynamic",
            }),
        }
    }

    /// Resolves a loadable constant (an `ldc` or bootstrap argument).
    pub(super) fn loadable(&self, index: u16) -> Result<ConstOperand> {
        Ok(match self.entry(index)? {
            CpEntry::Int(v) => ConstOperand::Int(*v),
            CpEntry::Float(v) => ConstOperand::Float(*v),
            CpEntry::Long(v) => ConstOperand::Long(*v),
            CpEntry::Double(v) => ConstOperand::Double(*v),
            CpEntry::Str { string_index } => ConstOperand::Str(self.utf8(*string_index)?.to_string()),
            CpEntry::Class { name_index } => ConstOperand::Class(self.utf8(*name_index)?.to_string()),
            CpEntry::MethodHandle { .. } => ConstOperand::MethodHandle(self.handle(index)?),
            CpEntry::MethodType { desc_index } => {
                ConstOperand::MethodType(self.utf8(*desc_index)?.to_string())
            }
            _ => {
                return Err(IrError::BadCpType {
                    index,
                    expected: "loadable constant",
                })
            }
        })
    }
}

/// Decodes the modified UTF-8 of the class file format: `C0 80` encodes NUL
/// and supplementary characters arrive as encoded surrogate pairs.
fn decode_mutf8(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let a = bytes[i];
        let unit = match a {
            // a raw NUL is not legal modified UTF-8 but obfuscated pools
            // contain them; accept instead of failing the entry
            0x00..=0x7f => {
                i += 1;
                a as u16
            }
            0xc0..=0xdf => {
                let b = *bytes.get(i + 1)?;
                i += 2;
                ((a as u16 & 0x1f) << 6) | (b as u16 & 0x3f)
            }
            0xe0..=0xef => {
                let b = *bytes.get(i + 1)?;
                let c = *bytes.get(i + 2)?;
                i += 3;
                ((a as u16 & 0x0f) << 12) | ((b as u16 & 0x3f) << 6) | (c as u16 & 0x3f)
            }
            _ => return None,
        };
        units.push(unit);
    }
    for decoded in char::decode_utf16(units) {
        // unpaired surrogates are smuggled through as replacement chars
        // rather than failing the whole pool entry
        out.push(decoded.unwrap_or(char::REPLACEMENT_CHARACTER));
    }
    Some(out)
}
