//! Network configuration model consumed from the ENI/ESI loaders. The
//! core never parses configuration files itself; it validates and binds a
//! ready-made `NetworkConfiguration` value.

use core::fmt;

/// Logical direction of a mapped process-image signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalDirection {
    Input,
    Output,
}

/// Identity of a configured or discovered slave.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlaveIdentity {
    pub name: String,
    pub alias: u16,
    /// Auto-increment chain position used for direct slave access.
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
}

impl SlaveIdentity {
    pub fn new(name: impl Into<String>, position: u16) -> Self {
        Self { name: name.into(), position, ..Self::default() }
    }
}

/// Binding between a logical signal name and a process-image bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalBinding {
    pub logical_name: String,
    pub direction: SignalDirection,
    pub slave_name: String,
    pub byte_offset: usize,
    pub bit_offset: u8,
}

impl SignalBinding {
    pub fn input(
        logical_name: impl Into<String>,
        slave_name: impl Into<String>,
        byte_offset: usize,
        bit_offset: u8,
    ) -> Self {
        Self {
            logical_name: logical_name.into(),
            direction: SignalDirection::Input,
            slave_name: slave_name.into(),
            byte_offset,
            bit_offset,
        }
    }

    pub fn output(
        logical_name: impl Into<String>,
        slave_name: impl Into<String>,
        byte_offset: usize,
        bit_offset: u8,
    ) -> Self {
        Self {
            logical_name: logical_name.into(),
            direction: SignalDirection::Output,
            slave_name: slave_name.into(),
            byte_offset,
            bit_offset,
        }
    }
}

/// Declared network: slave chain, signal table and image sizes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkConfiguration {
    pub slaves: Vec<SlaveIdentity>,
    pub signals: Vec<SignalBinding>,
    pub process_image_input_bytes: usize,
    pub process_image_output_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl NetworkConfiguration {
    /// Validate the configuration before any runtime state is bound.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let error = |message: String| ValidationIssue { severity: ValidationSeverity::Error, message };

        if self.process_image_input_bytes == 0 && self.process_image_output_bytes == 0 {
            issues.push(error(
                "process image cannot have both input and output sizes equal to zero".into(),
            ));
        }
        if self.signals.is_empty() {
            issues.push(error("configuration must contain at least one logical signal".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for signal in &self.signals {
            if signal.logical_name.is_empty() {
                issues.push(error("signal logical name cannot be empty".into()));
                continue;
            }
            if !seen.insert(signal.logical_name.as_str()) {
                issues.push(error(format!(
                    "duplicate logical signal name: {}",
                    signal.logical_name
                )));
            }
            if signal.slave_name.is_empty() {
                issues.push(error(format!("signal '{}' missing slave name", signal.logical_name)));
            }
            if signal.bit_offset >= 8 {
                issues.push(error(format!("signal '{}' has bit offset >= 8", signal.logical_name)));
            }
            let image_bytes = match signal.direction {
                SignalDirection::Input => self.process_image_input_bytes,
                SignalDirection::Output => self.process_image_output_bytes,
            };
            if signal.byte_offset >= image_bytes {
                issues.push(error(format!(
                    "signal '{}' byte offset {} outside process image size {}",
                    signal.logical_name, signal.byte_offset, image_bytes
                )));
            }
        }

        issues
    }

    pub fn has_errors(issues: &[ValidationIssue]) -> bool {
        issues.iter().any(|issue| issue.severity == ValidationSeverity::Error)
    }
}
