use std::fmt;

/// One broken business rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub property: Option<String>,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{}: {}", property, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Every broken rule found while validating an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(property: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(property, message);
        errors
    }

    pub fn add(&mut self, property: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            property: Some(property.to_string()),
            message: message.into(),
        });
    }

    pub fn add_general(&mut self, message: impl Into<String>) {
        self.errors.push(ValidationError {
            property: None,
            message: message.into(),
        });
    }

    /// Records `message` against `property` when `condition` does not hold.
    pub fn require(&mut self, condition: bool, property: &str, message: impl Into<String>) {
        if !condition {
            self.add(property, message);
        }
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates_all_rules() {
        let mut errors = ValidationErrors::new();
        errors.require(false, "Name", "Name is required");
        errors.require(true, "Age", "never recorded");
        errors.add_general("Something is off");

        assert_eq!(errors.len(), 2);
        assert_eq!(errors.to_string(), "Name: Name is required; Something is off");
        assert!(errors.into_result().is_err());
        assert!(ValidationErrors::new().into_result().is_ok());
    }
}
