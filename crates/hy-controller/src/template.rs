//! Trial template rendering.
//!
//! Templates carry `{{name}}` placeholders. `name` is either a study
//! parameter or one of the built-ins `trial_name` and `study_name`.

use hy_types::{ConfigError, StudyConfig, Trial};

const TRIAL_NAME: &str = "trial_name";
const STUDY_NAME: &str = "study_name";

/// Split a template into literal text and placeholder names.
fn segments(template: &str) -> Result<Vec<Segment<'_>>, ConfigError> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push(Segment::Text(&rest[..open]));
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| ConfigError::InvalidStudy {
            message: format!("unterminated placeholder in trial template at {:?}", &rest[open..]),
        })?;
        let name = after[..close].trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidStudy {
                message: "empty placeholder in trial template".to_string(),
            });
        }
        out.push(Segment::Placeholder(name));
        rest = &after[close + 2..];
    }
    out.push(Segment::Text(rest));
    Ok(out)
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Check that every placeholder can be resolved for trials of `study`.
pub fn validate_template(template: &str, study: &StudyConfig) -> Result<(), ConfigError> {
    for segment in segments(template)? {
        if let Segment::Placeholder(name) = segment {
            let known = name == TRIAL_NAME || name == STUDY_NAME || study.parameter(name).is_some();
            if !known {
                return Err(ConfigError::InvalidStudy {
                    message: format!("trial template references unknown placeholder {name}"),
                });
            }
        }
    }
    Ok(())
}

/// Substitute the trial's assignments into the template.
pub fn render(template: &str, trial: &Trial) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    for segment in segments(template)? {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Placeholder(TRIAL_NAME) => out.push_str(&trial.name),
            Segment::Placeholder(STUDY_NAME) => out.push_str(&trial.study_id),
            Segment::Placeholder(name) => {
                let value = trial.parameter(name).ok_or_else(|| ConfigError::InvalidStudy {
                    message: format!("trial {} has no value for {name}", trial.name),
                })?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hy_types::{ParameterAssignment, ParameterConfig};

    fn trial() -> Trial {
        Trial::new(
            "exp",
            "exp-abc12345",
            vec![
                ParameterAssignment::new("lr", "0.01"),
                ParameterAssignment::new("layers", "3"),
            ],
        )
    }

    #[test]
    fn substitutes_parameters_and_builtins() {
        let rendered = render(
            "train --lr={{lr}} --layers={{ layers }} --out=/tmp/{{study_name}}/{{trial_name}}",
            &trial(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "train --lr=0.01 --layers=3 --out=/tmp/exp/exp-abc12345"
        );
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        assert_eq!(render("echo hi", &trial()).unwrap(), "echo hi");
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(render("train --momentum={{momentum}}", &trial()).is_err());
    }

    #[test]
    fn unterminated_placeholder_rejected() {
        assert!(render("train --lr={{lr", &trial()).is_err());
        assert!(render("train {{}}", &trial()).is_err());
    }

    #[test]
    fn validation_checks_names_against_study() {
        let study = StudyConfig::new("exp", "accuracy")
            .with_parameter(ParameterConfig::double("lr", 0.01, 0.1));
        assert!(validate_template("train --lr={{lr}} {{trial_name}}", &study).is_ok());
        assert!(validate_template("train --lr={{learning_rate}}", &study).is_err());
    }
}
