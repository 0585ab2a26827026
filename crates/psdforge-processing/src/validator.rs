use psdforge_core::AppError;

/// First four bytes of every PSD/PSB container
pub const PSD_SIGNATURE: &[u8; 4] = b"8BPS";

/// Validation errors for PSD sources
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Empty file")]
    EmptyFile,

    #[error("Missing PSD signature (expected 8BPS)")]
    InvalidSignature,
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidSignature => AppError::DecodeFailure(err.to_string()),
            other => AppError::InvalidInput(other.to_string()),
        }
    }
}

pub fn has_psd_signature(data: &[u8]) -> bool {
    data.len() >= PSD_SIGNATURE.len() && &data[..PSD_SIGNATURE.len()] == PSD_SIGNATURE
}

/// PSD source validator
///
/// Size and container signature checks run before decoding.
pub struct PsdValidator {
    max_file_size: u64,
}

impl PsdValidator {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    pub fn validate_file_size(&self, size: u64) -> Result<(), ValidationError> {
        if size == 0 {
            return Err(ValidationError::EmptyFile);
        }

        if size > self.max_file_size {
            return Err(ValidationError::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }

        Ok(())
    }

    pub fn validate_signature(&self, data: &[u8]) -> Result<(), ValidationError> {
        if !has_psd_signature(data) {
            return Err(ValidationError::InvalidSignature);
        }
        Ok(())
    }

    /// Size then signature. Inputs are often temp files, so the name is not
    /// checked here.
    pub fn validate_source(&self, data: &[u8]) -> Result<(), ValidationError> {
        self.validate_file_size(data.len() as u64)?;
        self.validate_signature(data)
    }
}

impl Default for PsdValidator {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_size() {
        let validator = PsdValidator::new(100);
        assert!(matches!(
            validator.validate_file_size(0),
            Err(ValidationError::EmptyFile)
        ));
        assert!(matches!(
            validator.validate_file_size(101),
            Err(ValidationError::FileTooLarge { size: 101, max: 100 })
        ));
        assert!(validator.validate_file_size(100).is_ok());
    }

    #[test]
    fn test_validate_source() {
        let validator = PsdValidator::new(16);
        assert!(matches!(validator.validate_source(b""), Err(ValidationError::EmptyFile)));
        assert!(matches!(
            validator.validate_source(b"PK\x03\x04"),
            Err(ValidationError::InvalidSignature)
        ));
        assert!(matches!(
            validator.validate_source(&[b'8'; 17]),
            Err(ValidationError::FileTooLarge { size: 17, max: 16 })
        ));
        assert!(validator.validate_source(b"8BPS\x00\x01").is_ok());
    }

    #[test]
    fn test_signature_check() {
        let validator = PsdValidator::default();
        assert!(validator.validate_signature(b"8BPS\x00\x01").is_ok());
        assert!(validator.validate_signature(b"PK\x03\x04").is_err());
        assert!(validator.validate_signature(b"8B").is_err());
    }

    #[test]
    fn test_error_mapping() {
        let app: AppError = ValidationError::InvalidSignature.into();
        assert_eq!(app.kind(), "decode_failure");
        let app: AppError = ValidationError::EmptyFile.into();
        assert_eq!(app.kind(), "invalid_input");
    }
}
