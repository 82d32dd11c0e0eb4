//! OpenShift-style object templates: a list of raw objects with `${PARAM}` placeholders
//! and the declared parameters that may fill them.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use kube::api::{DynamicObject, GroupVersionKind};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

static PARAMETER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([a-zA-Z0-9_]+)\}").expect("valid parameter regex"));
// a whole string of this form is replaced by the JSON value of the parameter
static JSON_PARAMETER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{\{([a-zA-Z0-9_]+)\}\}$").expect("valid parameter regex"));

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Narrows the output of [`Template::process`]. An object is kept only if every filter retains it.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    RetainNamespaces,
    RetainAllButNamespaces,
    RetainGvk(GroupVersionKind),
}

impl Filter {
    fn retains(&self, gvk: &GroupVersionKind) -> bool {
        match self {
            Filter::RetainNamespaces => is_namespace(gvk),
            Filter::RetainAllButNamespaces => !is_namespace(gvk),
            Filter::RetainGvk(wanted) => wanted == gvk,
        }
    }
}

fn is_namespace(gvk: &GroupVersionKind) -> bool {
    gvk.group.is_empty() && gvk.kind == "Namespace"
}

/// The group, version and kind declared by an object
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::InvalidObject(format!(
            "object '{}' has no apiVersion or kind",
            obj.metadata.name.as_deref().unwrap_or_default()
        ))
    })?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

impl Template {
    /// Substitute the parameters into every object and keep the ones passing all filters.
    ///
    /// Values in `params` override the declared defaults of parameters with the same name;
    /// keys that the template does not declare are ignored.
    pub fn process(
        &self,
        params: &BTreeMap<String, String>,
        filters: &[Filter],
    ) -> Result<Vec<DynamicObject>> {
        let values = self.parameter_values(params)?;
        let mut objects = Vec::with_capacity(self.objects.len());
        for raw in &self.objects {
            let obj: DynamicObject = serde_json::from_value(substitute(raw, &values))?;
            if obj.metadata.name.as_deref().unwrap_or_default().is_empty() {
                return Err(Error::InvalidObject(
                    "template object without metadata.name".into(),
                ));
            }
            let gvk = gvk_of(&obj)?;
            if filters.iter().all(|f| f.retains(&gvk)) {
                objects.push(obj);
            }
        }
        Ok(objects)
    }

    fn parameter_values(&self, params: &BTreeMap<String, String>) -> Result<HashMap<&str, String>> {
        let mut values = HashMap::with_capacity(self.parameters.len());
        for param in &self.parameters {
            let value = params
                .get(&param.name)
                .or(param.value.as_ref())
                .filter(|v| !v.is_empty());
            match value {
                Some(value) => values.insert(param.name.as_str(), value.clone()),
                None if param.required => {
                    return Err(Error::MissingTemplateParameter(param.name.clone()))
                }
                None => values.insert(param.name.as_str(), String::new()),
            };
        }
        Ok(values)
    }
}

fn substitute(value: &Value, values: &HashMap<&str, String>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, values),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, values)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, values)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, values: &HashMap<&str, String>) -> Value {
    if let Some(caps) = JSON_PARAMETER.captures(s) {
        if let Some(value) = values.get(&caps[1]) {
            return serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()));
        }
    }
    let replaced = PARAMETER.replace_all(s, |caps: &Captures| {
        values
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    });
    Value::String(replaced.into_owned())
}
