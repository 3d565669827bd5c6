pub use lc_ir::{parse_class, ClassNode, ClassRecord, IrError, Universe};
pub use lc_passes::{list_passes, run_pipeline, CancelToken, PipelineSummary};

/// Builds the class universe from raw class bytes, keyed by container entry
/// name. Classes that fail to parse are returned alongside, untouched; the
/// caller decides whether to carry their bytes through unchanged.
pub fn load_universe(
    classes: impl IntoIterator<Item = (String, Vec<u8>)>,
) -> (Universe, Vec<(String, IrError)>) {
    let mut universe = Universe::new();
    let mut failed = Vec::new();
    for (entry, bytes) in classes {
        match parse_class(&bytes) {
            Ok(node) => {
                let mut record = ClassRecord::new(node);
                record.entry = Some(entry);
                record.bytes = Some(bytes);
                universe.insert(record);
            }
            Err(error) => failed.push((entry, error)),
        }
    }
    (universe, failed)
}
