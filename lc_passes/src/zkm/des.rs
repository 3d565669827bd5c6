//! ZKM DES decryption: references, then strings.
//!
//! ZKM routes member access and string constants through `invokedynamic`
//! sites whose bootstrap methods DES-decrypt their targets with a key the
//! static initializer computes. The pass re-runs that initializer in the
//! sandbox against a proxy copy of the class, invokes the bootstrap with
//! harvested call-site constants, and rewrites each site into the direct
//! reference (or the plaintext string) the handle resolves to.

use crate::helpers::{build_proxy, isolate_initializer, merge_static_initializers, value_to_const, CLINIT_PROXY};
use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result, UniverseHandler};
use lc_analysis::{analyze, ConstantRefHandler, Frame};
use lc_ir::opcodes::*;
use lc_ir::{
    ConstOperand, FieldType, Handle, HandleKind, Insn, InstructionModifier, MethodDescriptor,
    Universe,
};
use lc_vm::{Value, Vm};

static INFO: PassInfo = PassInfo {
    id: "zkm-des-decrypt",
    name: "ZKM DES decryption",
    category: Category::Zkm,
    description: "Resolves ZKM's DES-encrypted dynamic call sites back into \
                  direct references and plaintext strings.",
    tags: PassTags::RUNNABLE
        .union(PassTags::BETTER_DECOMPILE)
        .union(PassTags::BETTER_DEOBFUSCATE)
        .union(PassTags::POSSIBLY_MALICIOUS),
};

#[derive(Default)]
struct Counters {
    ref_attempted: usize,
    ref_decrypted: usize,
    string_attempted: usize,
    string_decrypted: usize,
}

pub struct ZkmDesDecryption {
    totals: Counters,
}

impl ZkmDesDecryption {
    pub fn new() -> Self {
        Self {
            totals: Counters::default(),
        }
    }
}

impl Default for ZkmDesDecryption {
    fn default() -> Self {
        Self::new()
    }
}

/// The ZKM "real bootstrap" signature:
/// `(Lookup, MutableCallSite, String, MethodType, (J|I)...) MethodHandle`.
fn is_real_bootstrap(handle: &Handle) -> bool {
    let Ok(desc) = handle.desc.parse::<MethodDescriptor>() else {
        return false;
    };
    let object = |ty: Option<&FieldType>, name: &str| {
        matches!(ty, Some(FieldType::Object(c)) if c == name)
    };
    let params = &desc.params;
    params.len() >= 5
        && object(params.first(), "java/lang/invoke/MethodHandles$Lookup")
        && object(params.get(1), "java/lang/invoke/MutableCallSite")
        && object(params.get(2), "java/lang/String")
        && object(params.get(3), "java/lang/invoke/MethodType")
        && params[4..]
            .iter()
            .all(|t| matches!(t, FieldType::Long | FieldType::Int))
        && object(desc.ret.as_ref(), "java/lang/invoke/MethodHandle")
}

/// A string site: `(I|J...) -> String` with a two-argument decryptor
/// `(int|long, long) -> String` synthesized into the target class.
fn is_string_site(site_desc: &str, bootstrap: &Handle, class: &str) -> bool {
    if bootstrap.owner != class {
        return false;
    }
    let Ok(site) = site_desc.parse::<MethodDescriptor>() else {
        return false;
    };
    let Ok(decryptor) = bootstrap.desc.parse::<MethodDescriptor>() else {
        return false;
    };
    let returns_string =
        |d: &MethodDescriptor| matches!(&d.ret, Some(FieldType::Object(c)) if c == "java/lang/String");
    returns_string(&site)
        && !site.params.is_empty()
        && site
            .params
            .iter()
            .all(|t| matches!(t, FieldType::Int | FieldType::Long))
        && returns_string(&decryptor)
        && decryptor.params.len() == 2
        && matches!(decryptor.params[0], FieldType::Int | FieldType::Long)
        && matches!(decryptor.params[1], FieldType::Long)
}

/// Top-of-stack constants in argument order, `None` where unknown.
fn harvest(frame: &Frame, count: usize) -> Vec<Option<ConstOperand>> {
    (0..count)
        .map(|index| {
            frame
                .peek(count - 1 - index)
                .and_then(|value| value.as_known().cloned())
        })
        .collect()
}

/// The direct instruction a revealed handle stands for.
fn direct_insn(handle: &Handle) -> Option<Insn> {
    let field = |op| Insn::Field {
        op,
        owner: handle.owner.clone(),
        name: handle.name.clone(),
        desc: handle.desc.clone(),
    };
    let method = |op| Insn::Method {
        op,
        owner: handle.owner.clone(),
        name: handle.name.clone(),
        desc: handle.desc.clone(),
    };
    Some(match handle.kind {
        HandleKind::GetStatic => field(GETSTATIC),
        HandleKind::PutStatic => field(PUTSTATIC),
        HandleKind::GetField => field(GETFIELD),
        HandleKind::PutField => field(PUTFIELD),
        HandleKind::InvokeStatic => method(INVOKESTATIC),
        HandleKind::InvokeVirtual => method(INVOKEVIRTUAL),
        HandleKind::InvokeSpecial => method(INVOKESPECIAL),
        HandleKind::InvokeInterface => method(INVOKEINTERFACE),
        HandleKind::NewInvokeSpecial => return None,
    })
}

/// Positions of the `count` real instructions before `pos`, nearest first.
fn preceding_real(insns: &[Insn], pos: usize, count: usize) -> Vec<usize> {
    insns[..pos]
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, insn)| insn.is_real())
        .take(count)
        .map(|(index, _)| index)
        .collect()
}

fn is_const_push(insn: &Insn) -> bool {
    match insn {
        Insn::IntPush { .. } | Insn::Ldc(_) => true,
        Insn::Simple(op) => matches!(*op, ACONST_NULL..=DCONST_1),
        _ => false,
    }
}

/// Static fields of the proxied class read back through the sandbox, so the
/// analyzer folds `GETSTATIC key ; LDC salt ; LXOR` chains into the key.
struct ProxyFieldValues<'a, 'h> {
    vm: &'a Vm<'h>,
    class: &'a str,
    proxy: &'a str,
}

impl ConstantRefHandler for ProxyFieldValues<'_, '_> {
    fn field_value(&self, owner: &str, name: &str, desc: &str) -> Option<ConstOperand> {
        if owner != self.class {
            return None;
        }
        value_to_const(&self.vm.static_field(self.proxy, name, desc)?)
    }
}

enum ClassOutcome {
    Skipped,
    Aborted(String),
    Done {
        counters: Counters,
        edits: Vec<(usize, InstructionModifier)>,
    },
}

impl Pass for ZkmDesDecryption {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.totals = Counters::default();

        for class_name in universe.names() {
            if ctx.cancelled() {
                break;
            }
            match process_class(universe, &class_name, ctx) {
                ClassOutcome::Skipped => {}
                ClassOutcome::Aborted(reason) => {
                    log::warn!("{}: {}", class_name, reason);
                    if let Some(record) = universe.get_mut(&class_name) {
                        record.fail(reason);
                    }
                }
                ClassOutcome::Done { counters, edits } => {
                    if let Some(record) = universe.get_mut(&class_name) {
                        for (method_index, mods) in edits {
                            mods.apply(&mut record.node.methods[method_index]);
                        }
                    }
                    log::info!(
                        "{}: {}/{} references, {}/{} strings decrypted",
                        class_name,
                        counters.ref_decrypted,
                        counters.ref_attempted,
                        counters.string_decrypted,
                        counters.string_attempted,
                    );
                    self.totals.ref_attempted += counters.ref_attempted;
                    self.totals.ref_decrypted += counters.ref_decrypted;
                    self.totals.string_attempted += counters.string_attempted;
                    self.totals.string_decrypted += counters.string_decrypted;
                }
            }
        }

        log::info!(
            "zkm des: {} references and {} strings decrypted",
            self.totals.ref_decrypted,
            self.totals.string_decrypted
        );
        Ok(self.totals.ref_decrypted + self.totals.string_decrypted > 0)
    }
}

fn process_class(universe: &Universe, class_name: &str, ctx: &PassContext) -> ClassOutcome {
    let Some(record) = universe.get(class_name) else {
        return ClassOutcome::Skipped;
    };
    let node = &record.node;

    let has_sites = node.methods.iter().any(|m| {
        m.insns.iter().any(|insn| {
            matches!(insn, Insn::InvokeDynamic { desc, bootstrap, .. }
                if is_string_site(desc, bootstrap, class_name) || is_real_bootstrap(bootstrap))
        })
    });
    if !has_sites || node.static_initializers().is_empty() {
        return ClassOutcome::Skipped;
    }

    // isolate and re-run the initializer against a proxy copy
    let mut work = node.clone();
    merge_static_initializers(&mut work);
    let mut isolated = 0;
    if let Some(clinit) = work.static_initializer_mut() {
        isolated = isolate_initializer(clinit, class_name);
    }
    let proxy_name = format!("{}$proxy", class_name);
    let proxy = build_proxy(&work, &proxy_name);

    let handler = UniverseHandler::new(universe);
    let vm = Vm::new(&handler);
    vm.preload(proxy);
    if ctx.verbose && isolated > 0 {
        log::debug!("{}: {} foreign calls stripped from initializer", class_name, isolated);
    }
    match vm.invoke_static(&proxy_name, CLINIT_PROXY, "()V", Vec::new()) {
        Ok(_) => {}
        Err(error) if error.is_bad_padding() => {
            return ClassOutcome::Aborted("key recovery failed (bad padding)".to_string());
        }
        Err(error) if error.is_null_deref() => {
            // expected artifact of the isolated initializer
            log::debug!("{}: initializer null deref ignored", class_name);
        }
        Err(error) => {
            return ClassOutcome::Aborted(format!("initializer failed: {}", error));
        }
    }

    // key fallback: a static long field filled by the initializer
    let key_fallback = work
        .fields
        .iter()
        .filter(|f| f.is_static() && f.desc == "J")
        .find_map(|f| match vm.static_field(&proxy_name, &f.name, "J") {
            Some(Value::Long(v)) if v != 0 => Some(v),
            _ => None,
        });
    if let Some(key) = key_fallback {
        log::debug!(
            "{}: initializer key {}",
            class_name,
            hex::encode(key.to_be_bytes())
        );
    }

    let field_refs = ProxyFieldValues {
        vm: &vm,
        class: class_name,
        proxy: &proxy_name,
    };

    let mut counters = Counters::default();
    let mut edits = Vec::new();
    for (method_index, method) in node.methods.iter().enumerate() {
        let Ok(frames) = analyze(method, &field_refs) else {
            continue;
        };
        let mut mods = InstructionModifier::new();
        for (pos, insn) in method.insns.iter().enumerate() {
            let Insn::InvokeDynamic {
                name: site_name,
                desc: site_desc,
                bootstrap,
                ..
            } = insn
            else {
                continue;
            };
            if is_string_site(site_desc, bootstrap, class_name) {
                counters.string_attempted += 1;
                if decrypt_string_site(
                    &vm, &proxy_name, method, &frames, pos, site_desc, bootstrap, &mut mods,
                ) {
                    counters.string_decrypted += 1;
                }
            } else if is_real_bootstrap(bootstrap) && bootstrap.owner == *class_name {
                counters.ref_attempted += 1;
                if decrypt_reference_site(
                    &vm,
                    class_name,
                    &proxy_name,
                    method,
                    &frames,
                    pos,
                    site_name,
                    site_desc,
                    bootstrap,
                    key_fallback,
                    &mut mods,
                ) {
                    counters.ref_decrypted += 1;
                }
            }
        }
        if !mods.is_empty() {
            edits.push((method_index, mods));
        }
    }

    ClassOutcome::Done { counters, edits }
}

#[allow(clippy::too_many_arguments)]
fn decrypt_reference_site(
    vm: &Vm<'_>,
    class_name: &str,
    proxy_name: &str,
    method: &lc_ir::MethodNode,
    frames: &[Option<Frame>],
    pos: usize,
    site_name: &str,
    site_desc: &str,
    bootstrap: &Handle,
    key_fallback: Option<i64>,
    mods: &mut InstructionModifier,
) -> bool {
    let Ok(bsm_desc) = bootstrap.desc.parse::<MethodDescriptor>() else {
        return false;
    };
    let needed = bsm_desc.params.len() - 4;
    let Some(frame) = frames.get(pos).and_then(|f| f.as_ref()) else {
        return false;
    };

    let mut harvested = harvest(frame, needed);
    if let Some(last @ None) = harvested.last_mut() {
        // the trailing key argument may only be recoverable from the field
        if let (Some(key), Some(FieldType::Long)) = (key_fallback, bsm_desc.params.last()) {
            *last = Some(ConstOperand::Long(key));
        }
    }
    let Some(arguments) = harvested.into_iter().collect::<Option<Vec<ConstOperand>>>() else {
        log::debug!("{}: unknown bootstrap argument, site kept", site_name);
        return false;
    };

    let mut call_args = vec![
        vm.trusted_lookup(),
        Value::Null,
        vm.intern(site_name),
        vm.constant(&ConstOperand::MethodType(site_desc.to_string())),
    ];
    call_args.extend(arguments.iter().map(|c| vm.constant(c)));

    let resolved = match vm.invoke_static(proxy_name, &bootstrap.name, &bootstrap.desc, call_args) {
        Ok(Some(value)) => value,
        Ok(None) => return false,
        Err(error) => {
            log::debug!("bootstrap invocation failed: {}", error);
            return false;
        }
    };
    let Some(mut target) = vm.reveal_method_handle(&resolved) else {
        return false;
    };
    // the proxy's self-references resolve to the proxy name; the rewritten
    // instruction must point at the real class
    if target.owner == proxy_name {
        target.owner = class_name.to_string();
    }
    let Some(direct) = direct_insn(&target) else {
        log::debug!("constructor handle at {}, site kept", site_name);
        return false;
    };

    // clear the key operands first (they sit on top): the call site built
    // the key as `GETSTATIC J ; LDC J ; LXOR`, so dropping the xor leaves
    // two longs to pop
    let mut replacement = Vec::new();
    let Ok(site) = site_desc.parse::<MethodDescriptor>() else {
        return false;
    };
    let xor_pos = preceding_real(&method.insns, pos, 1)
        .first()
        .copied()
        .filter(|&p| matches!(method.insns[p], Insn::Simple(LXOR)));
    match xor_pos {
        Some(p) => {
            mods.remove(p);
            replacement.push(Insn::Simple(POP2));
            replacement.push(Insn::Simple(POP2));
        }
        None => {
            if let Some(param) = site.params.last() {
                replacement.push(Insn::Simple(if param.size() == 2 { POP2 } else { POP }));
            }
        }
    }
    for param in site.params.iter().rev().skip(1) {
        replacement.push(Insn::Simple(if param.size() == 2 { POP2 } else { POP }));
    }
    replacement.push(direct);
    mods.replace(pos, replacement);
    true
}

#[allow(clippy::too_many_arguments)]
fn decrypt_string_site(
    vm: &Vm<'_>,
    proxy_name: &str,
    method: &lc_ir::MethodNode,
    frames: &[Option<Frame>],
    pos: usize,
    site_desc: &str,
    bootstrap: &Handle,
    mods: &mut InstructionModifier,
) -> bool {
    let Ok(site) = site_desc.parse::<MethodDescriptor>() else {
        return false;
    };
    let Some(frame) = frames.get(pos).and_then(|f| f.as_ref()) else {
        return false;
    };
    let Some(arguments) = harvest(frame, site.params.len())
        .into_iter()
        .collect::<Option<Vec<ConstOperand>>>()
    else {
        return false;
    };

    let call_args: Vec<Value> = arguments.iter().map(|c| vm.constant(c)).collect();
    let decrypted = match vm.invoke_static(proxy_name, &bootstrap.name, &bootstrap.desc, call_args)
    {
        Ok(Some(value)) => match value.as_str() {
            Some(s) => s,
            None => return false,
        },
        Ok(None) => return false,
        Err(error) => {
            log::debug!("string decryption failed: {}", error);
            return false;
        }
    };

    // drop the operand pushes when they sit right before the site,
    // otherwise pop them so the stack still balances
    let prev = preceding_real(&method.insns, pos, site.params.len());
    if prev.len() == site.params.len()
        && prev.iter().all(|&p| is_const_push(&method.insns[p]))
    {
        for p in prev {
            mods.remove(p);
        }
        mods.replace(pos, vec![Insn::Ldc(ConstOperand::Str(decrypted))]);
    } else {
        let mut replacement: Vec<Insn> = site
            .params
            .iter()
            .rev()
            .map(|param| Insn::Simple(if param.size() == 2 { POP2 } else { POP }))
            .collect();
        replacement.push(Insn::Ldc(ConstOperand::Str(decrypted)));
        mods.replace(pos, replacement);
    }
    true
}
