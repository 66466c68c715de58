//! # Módulo de Validação
//!
//! Valida um `SutConfig` e um `Scenario` antes de o scheduler começar a
//! despachar instâncias, para evitar descobrir um `service` inexistente ou um
//! nome de step duplicado só depois de já termos disparado requisições.
//!
//! ## Para todos entenderem:
//!
//! Antes de rodar milhares de instâncias, vale a pena conferir o "formulário"
//! inteiro de uma vez: todo erro relevante é coletado num só `Vec`, não
//! apenas o primeiro encontrado — assim quem escreveu o cenário corrige tudo
//! numa única passada.
//!
//! ## Validações realizadas:
//!
//! - Todo `service` referenciado por um step `Http`/`Wait` existe em `sut.services`.
//! - `Branch.if_true`/`if_false` não repetem nomes de step dentro da própria lista.
//! - Todo `Step.name` é único no fluxo achatado do cenário, incluindo os ramos
//!   aninhados de `Branch` — assertions e artefatos são chaveados pelo nome.
//! - `max_steps` é um inteiro positivo.

use std::collections::HashSet;

use crate::errors::{ConfigError, ErrorKind};
use crate::model::{Scenario, Step, SutConfig};

pub type ValidationResult = Result<(), Vec<ConfigError>>;

/// Valida um `SutConfig` isoladamente: hoje isso é só garantir que não há
/// `Service.base_url` vazio, já que a forma dos dados em si é garantida pelo
/// parser de `loader`.
pub fn validate_sut(sut: &SutConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if sut.services.is_empty() {
        errors.push(ConfigError::new(
            ErrorKind::InvalidSut,
            format!("SUT '{}' declares no services", sut.name),
        ));
    }

    for (name, service) in &sut.services {
        if service.base_url.trim().is_empty() {
            errors.push(ConfigError::new(
                ErrorKind::InvalidSut,
                format!("service '{name}' has an empty base_url"),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Valida um `Scenario` contra o `SutConfig` que ele exercita.
pub fn validate_scenario(scenario: &Scenario, sut: &SutConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if scenario.max_steps == 0 {
        errors.push(ConfigError::new(
            ErrorKind::InvalidScenario,
            format!("scenario '{}': max_steps must be a positive integer", scenario.id),
        ));
    }

    let mut seen_names: HashSet<&str> = HashSet::new();
    check_flow(&scenario.flow, sut, &scenario.id, &mut seen_names, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_flow<'a>(
    steps: &'a [Step],
    sut: &SutConfig,
    scenario_id: &str,
    seen_names: &mut HashSet<&'a str>,
    errors: &mut Vec<ConfigError>,
) {
    for step in steps {
        if !seen_names.insert(step.name()) {
            errors.push(ConfigError::new(
                ErrorKind::InvalidScenario,
                format!(
                    "scenario '{scenario_id}': step name '{}' is used more than once",
                    step.name()
                ),
            ));
        }

        match step {
            Step::Http(s) => check_service(&s.service, sut, scenario_id, &s.name, errors),
            Step::Wait(s) => check_service(&s.service, sut, scenario_id, &s.name, errors),
            Step::Assert(_) => {}
            Step::Branch(b) => {
                check_branch_arm_uniqueness(&b.if_true, scenario_id, &b.name, "if_true", errors);
                check_branch_arm_uniqueness(&b.if_false, scenario_id, &b.name, "if_false", errors);
                check_flow(&b.if_true, sut, scenario_id, seen_names, errors);
                check_flow(&b.if_false, sut, scenario_id, seen_names, errors);
            }
        }
    }
}

fn check_service(
    service: &str,
    sut: &SutConfig,
    scenario_id: &str,
    step_name: &str,
    errors: &mut Vec<ConfigError>,
) {
    if !sut.services.contains_key(service) {
        errors.push(ConfigError::new(
            ErrorKind::MissingService,
            format!(
                "scenario '{scenario_id}': step '{step_name}' references unknown service '{service}'"
            ),
        ));
    }
}

fn check_branch_arm_uniqueness(
    arm: &[Step],
    scenario_id: &str,
    branch_name: &str,
    arm_name: &str,
    errors: &mut Vec<ConfigError>,
) {
    let mut names = HashSet::new();
    for step in arm {
        if !names.insert(step.name()) {
            errors.push(ConfigError::new(
                ErrorKind::InvalidScenario,
                format!(
                    "scenario '{scenario_id}': branch '{branch_name}'.{arm_name} repeats step name '{}'",
                    step.name()
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssertExpect, AssertStep, BranchStep, HttpStep, Service};
    use std::collections::HashMap;

    fn sut_with(services: &[&str]) -> SutConfig {
        let mut map = HashMap::new();
        for name in services {
            map.insert(
                name.to_string(),
                Service { base_url: "http://localhost:8080".to_string(), timeout_seconds: None, headers: HashMap::new() },
            );
        }
        SutConfig { name: "sut".into(), services: map, default_headers: HashMap::new(), turbulence: None }
    }

    fn http_step(name: &str, service: &str) -> Step {
        Step::Http(HttpStep {
            name: name.into(),
            service: service.into(),
            method: "GET".into(),
            path: "/".into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            form: false,
            extract: HashMap::new(),
            retry: None,
        })
    }

    fn assert_step(name: &str) -> Step {
        Step::Assert(AssertStep { name: name.into(), expect: AssertExpect::default() })
    }

    fn scenario(flow: Vec<Step>) -> Scenario {
        Scenario {
            id: "s1".into(),
            description: None,
            entry: None,
            flow,
            assertions: vec![],
            stop_when: Default::default(),
            max_steps: 10,
        }
    }

    #[test]
    fn valid_scenario_passes() {
        let sut = sut_with(&["cart"]);
        let scenario = scenario(vec![http_step("get_cart", "cart")]);
        assert!(validate_scenario(&scenario, &sut).is_ok());
    }

    #[test]
    fn missing_service_is_reported() {
        let sut = sut_with(&["cart"]);
        let scenario = scenario(vec![http_step("get_orders", "orders")]);
        let errors = validate_scenario(&scenario, &sut).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::MissingService);
    }

    #[test]
    fn duplicate_step_name_is_reported() {
        let sut = sut_with(&["cart"]);
        let scenario = scenario(vec![http_step("get_cart", "cart"), assert_step("get_cart")]);
        let errors = validate_scenario(&scenario, &sut).unwrap_err();
        assert!(errors.iter().any(|e| e.kind == ErrorKind::InvalidScenario));
    }

    #[test]
    fn duplicate_name_inside_branch_arm_is_reported() {
        let sut = sut_with(&["cart"]);
        let branch = Step::Branch(BranchStep {
            name: "maybe_retry".into(),
            condition: "true".into(),
            if_true: vec![assert_step("dup"), assert_step("dup")],
            if_false: vec![],
        });
        let scenario = scenario(vec![branch]);
        let errors = validate_scenario(&scenario, &sut).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("repeats step name")));
    }

    #[test]
    fn nested_branch_service_reference_is_checked() {
        let sut = sut_with(&["cart"]);
        let branch = Step::Branch(BranchStep {
            name: "maybe_checkout".into(),
            condition: "true".into(),
            if_true: vec![http_step("checkout", "payments")],
            if_false: vec![],
        });
        let scenario = scenario(vec![branch]);
        let errors = validate_scenario(&scenario, &sut).unwrap_err();
        assert!(errors.iter().any(|e| e.kind == ErrorKind::MissingService));
    }

    #[test]
    fn zero_max_steps_is_rejected() {
        let sut = sut_with(&["cart"]);
        let mut scenario = scenario(vec![http_step("get_cart", "cart")]);
        scenario.max_steps = 0;
        let errors = validate_scenario(&scenario, &sut).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("max_steps")));
    }

    #[test]
    fn sut_with_no_services_is_rejected() {
        let sut = sut_with(&[]);
        assert!(validate_sut(&sut).is_err());
    }
}
