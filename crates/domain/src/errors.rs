//! 领域模型错误定义

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 验证错误
    #[error("validation failed: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// 业务规则违反错误
    #[error("business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建业务规则违反错误
    pub fn business_rule_violation(rule: impl Into<String>) -> Self {
        Self::BusinessRuleViolation { rule: rule.into() }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
