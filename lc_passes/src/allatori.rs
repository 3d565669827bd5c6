//! Allatori string decryption.
//!
//! Allatori garbles string constants and routes them through a synthesized
//! static `decrypt(String)String` in the same class set, usually right next
//! to the load: `LDC <garbled> ; INVOKESTATIC decrypt`. Running the
//! decryptor in the sandbox with the garbled constant yields the plaintext,
//! and the pair collapses into one `LDC`.

use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result, UniverseHandler};
use lc_ir::opcodes::INVOKESTATIC;
use lc_ir::{ConstOperand, Insn, InstructionModifier, Universe};
use lc_vm::Vm;

static INFO: PassInfo = PassInfo {
    id: "allatori-decrypt-strings",
    name: "Allatori string decryption",
    category: Category::Allatori,
    description: "Runs Allatori's string decryptor in the sandbox and \
                  replaces garbled constants with their plaintext.",
    tags: PassTags::RUNNABLE
        .union(PassTags::BETTER_DECOMPILE)
        .union(PassTags::BETTER_DEOBFUSCATE)
        .union(PassTags::POSSIBLY_MALICIOUS),
};

const DECRYPT_DESC: &str = "(Ljava/lang/String;)Ljava/lang/String;";

pub struct AllatoriStringDecryption {
    attempted: usize,
    decrypted: usize,
}

impl AllatoriStringDecryption {
    pub fn new() -> Self {
        Self {
            attempted: 0,
            decrypted: 0,
        }
    }
}

impl Default for AllatoriStringDecryption {
    fn default() -> Self {
        Self::new()
    }
}

/// `LDC <string>` feeding a static `(String)String` call into a method the
/// universe itself supplies.
fn decryptor_of(universe: &Universe, insn: &Insn) -> Option<(String, String)> {
    let Insn::Method {
        op: INVOKESTATIC,
        owner,
        name,
        desc,
    } = insn
    else {
        return None;
    };
    if desc != DECRYPT_DESC {
        return None;
    }
    let record = universe.get(owner)?;
    let method = record.node.method(name, desc)?;
    method.is_static().then(|| (owner.clone(), name.clone()))
}

impl Pass for AllatoriStringDecryption {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.attempted = 0;
        self.decrypted = 0;

        let mut edits: Vec<(String, usize, InstructionModifier)> = Vec::new();
        {
            let handler = UniverseHandler::new(universe);
            let vm = Vm::new(&handler);

            for class_name in universe.names() {
                if ctx.cancelled() {
                    break;
                }
                let Some(record) = universe.get(&class_name) else {
                    continue;
                };
                for (method_index, method) in record.node.methods.iter().enumerate() {
                    let mut mods = InstructionModifier::new();
                    for (pos, window) in method.insns.windows(2).enumerate() {
                        let Insn::Ldc(ConstOperand::Str(garbled)) = &window[0] else {
                            continue;
                        };
                        let Some((owner, decrypt_name)) = decryptor_of(universe, &window[1])
                        else {
                            continue;
                        };
                        // never rewrite the decryptor's own self-calls
                        if class_name == owner && method.name == decrypt_name {
                            continue;
                        }
                        self.attempted += 1;
                        let result = vm.invoke_static(
                            &owner,
                            &decrypt_name,
                            DECRYPT_DESC,
                            vec![vm.intern(garbled)],
                        );
                        let plain = match result {
                            Ok(Some(value)) => match value.as_str() {
                                Some(s) => s,
                                None => continue,
                            },
                            Ok(None) => continue,
                            Err(error) => {
                                log::debug!(
                                    "{}.{} failed on a constant: {}",
                                    owner,
                                    decrypt_name,
                                    error
                                );
                                continue;
                            }
                        };
                        mods.remove(pos);
                        mods.replace(pos + 1, vec![Insn::Ldc(ConstOperand::Str(plain))]);
                        self.decrypted += 1;
                    }
                    if !mods.is_empty() {
                        edits.push((class_name.clone(), method_index, mods));
                    }
                }
            }
        }

        for (class_name, method_index, mods) in edits {
            if let Some(record) = universe.get_mut(&class_name) {
                mods.apply(&mut record.node.methods[method_index]);
            }
        }

        if ctx.verbose {
            log::debug!(
                "{} of {} candidate constants decrypted",
                self.decrypted,
                self.attempted
            );
        }
        log::info!(
            "allatori strings: {} constants decrypted",
            self.decrypted
        );
        Ok(self.decrypted > 0)
    }
}
