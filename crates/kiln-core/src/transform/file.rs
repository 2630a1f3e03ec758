//! Binary asset handler.

use super::{OutputKind, StageOutput, Transform, TransformContext, TransformFailure};

/// Emits the file unchanged as a standalone asset.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileEmit;

impl Transform for FileEmit {
    fn name(&self) -> &str {
        "file"
    }

    fn transform(
        &self,
        content: Vec<u8>,
        _ctx: &TransformContext<'_>,
    ) -> Result<StageOutput, TransformFailure> {
        Ok(StageOutput::content(content).with_kind(OutputKind::Asset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::identity::{FileIdentity, FileKind};
    use crate::transform::{Dispatcher, RuleTable};
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn test_asset_bytes_pass_through() {
        let dispatcher = Dispatcher::from_rules(
            RuleTable::new().rule(&[FileKind::Image, FileKind::Font], vec![Arc::new(FileEmit)]),
        );
        let bytes = vec![0x89, b'P', b'N', b'G', 0, 1, 2];
        let result = dispatcher
            .transform(
                &FileIdentity::new("/p/src/images/logo.png"),
                bytes.clone(),
                Mode::Production,
                Path::new("/p"),
            )
            .unwrap();
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.outputs[0].kind, OutputKind::Asset);
        assert_eq!(result.outputs[0].hint, "logo.png");
        assert_eq!(result.outputs[0].bytes, bytes);
        assert!(result.dependencies.is_empty());
    }
}
