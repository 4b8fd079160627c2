//! Handlebars strict-mode augmentation of a stored metadata blob with
//! operator-configured template fields (spec §4.6).

use std::collections::HashMap;

use handlebars::Handlebars;
use serde_json::Value;
use tracing::warn;

pub struct TemplateAugmenter {
    registry: Handlebars<'static>,
    fields: HashMap<String, String>,
}

impl TemplateAugmenter {
    pub fn new(fields: HashMap<String, String>) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        Self { registry, fields }
    }

    /// Renders each configured field against `blob` and merges the result
    /// into `blob`'s top-level object, without overwriting a field the
    /// stored metadata already defines. Any single template failure (an
    /// unresolved strict-mode reference, a render error) leaves `blob`
    /// entirely unchanged -- augmentation is best-effort, never fatal to
    /// the read path.
    pub fn augment(&self, blob: &Value) -> Value {
        if self.fields.is_empty() {
            return blob.clone();
        }

        let Value::Object(map) = blob else {
            return blob.clone();
        };

        let mut rendered = HashMap::with_capacity(self.fields.len());
        for (field, template) in &self.fields {
            if map.contains_key(field) {
                continue;
            }
            match self.registry.render_template(template, blob) {
                Ok(value) => {
                    rendered.insert(field.clone(), value);
                }
                Err(err) => {
                    warn!(field, error = %err, "template augmentation failed, leaving metadata unchanged");
                    return blob.clone();
                }
            }
        }

        let mut augmented = map.clone();
        for (field, value) in rendered {
            augmented.insert(field, Value::String(value));
        }
        Value::Object(augmented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_configured_field_from_existing_data() {
        let mut fields = HashMap::new();
        fields.insert("fqdn".to_string(), "{{hostname}}.example.net".to_string());
        let augmenter = TemplateAugmenter::new(fields);

        let blob = json!({"hostname": "host-1"});
        let augmented = augmenter.augment(&blob);
        assert_eq!(augmented["fqdn"], json!("host-1.example.net"));
        assert_eq!(augmented["hostname"], json!("host-1"));
    }

    #[test]
    fn existing_field_is_never_overwritten() {
        let mut fields = HashMap::new();
        fields.insert("hostname".to_string(), "should-not-apply".to_string());
        let augmenter = TemplateAugmenter::new(fields);

        let blob = json!({"hostname": "host-1"});
        let augmented = augmenter.augment(&blob);
        assert_eq!(augmented["hostname"], json!("host-1"));
    }

    #[test]
    fn unresolved_strict_reference_leaves_blob_unchanged() {
        let mut fields = HashMap::new();
        fields.insert("fqdn".to_string(), "{{missing_field}}.example.net".to_string());
        let augmenter = TemplateAugmenter::new(fields);

        let blob = json!({"hostname": "host-1"});
        let augmented = augmenter.augment(&blob);
        assert_eq!(augmented, blob);
    }

    #[test]
    fn no_configured_fields_is_a_no_op() {
        let augmenter = TemplateAugmenter::new(HashMap::new());
        let blob = json!({"hostname": "host-1"});
        assert_eq!(augmenter.augment(&blob), blob);
    }
}
