use std::sync::Arc;

use serde_json::{Value, json};

use crate::assertions::{ensure, error_issues, expect_resource_type};
use crate::client::{Scope, outcome_diagnostics};
use crate::descriptor::ModuleDescriptor;
use crate::error::{CaseError, CaseResult, ClientError};
use crate::fhir::ResourceType;
use crate::fixtures::synthesize;
use crate::module::{ModuleContext, TestCase, TestModule};

fn validate_parameters(resource: Value) -> Value {
    json!({
        "resourceType": "Parameters",
        "parameter": [{ "name": "resource", "resource": resource }]
    })
}

/// `$validate` at type level.
#[derive(Default)]
pub struct ValidationSuite {
    ctx: ModuleContext,
}

impl ValidationSuite {
    async fn valid_resource(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let params = validate_parameters(synthesize(&ResourceType::Patient));
        let outcome = client
            .operation(&Scope::Type("Patient".into()), "validate", Some(&params))
            .await?;
        expect_resource_type(&outcome, "OperationOutcome")?;
        let errors = error_issues(&outcome);
        ensure(errors.is_empty(), || {
            format!("valid Patient reported errors: {}", outcome_diagnostics(&outcome))
        })
    }

    async fn invalid_resource(self: Arc<Self>) -> CaseResult {
        let client = self.ctx.client()?;
        let mut patient = synthesize(&ResourceType::Patient);
        patient["gender"] = json!("not-a-gender");
        patient["birthDate"] = json!("yesterday");
        let params = validate_parameters(patient);

        let outcome = match client
            .operation(&Scope::Type("Patient".into()), "validate", Some(&params))
            .await
        {
            Ok(outcome) => outcome,
            Err(ClientError::Status {
                outcome: Some(outcome),
                ..
            }) => outcome,
            Err(e) => {
                return Err(CaseError::fail_with(
                    "$validate rejected the resource without an OperationOutcome",
                    e,
                ));
            }
        };
        expect_resource_type(&outcome, "OperationOutcome")?;
        ensure(!error_issues(&outcome).is_empty(), || {
            "invalid Patient produced no error issues".to_string()
        })
    }
}

impl TestModule for ValidationSuite {
    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("Validation")
    }

    fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn cases() -> Vec<TestCase<Self>> {
        vec![
            TestCase::new("VA01", "$validate accepts a valid resource", Self::valid_resource),
            TestCase::new("VA02", "$validate reports errors for an invalid resource", Self::invalid_resource),
        ]
    }
}
