use crate::error::{Error, Result};

// --env / --rmenv directives, applied in the child just before exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOp {
    Set { name: String, value: String },
    Rm { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvStore {
    ops: Vec<EnvOp>,
}

impl EnvStore {
    pub fn set(&mut self, kv: &str) -> Result<()> {
        let (name, value) = kv
            .split_once('=')
            .ok_or_else(|| Error::config("invalid --env option"))?;
        if name.is_empty() {
            return Err(Error::config("invalid --env option"));
        }
        self.ops.push(EnvOp::Set {
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    pub fn rm(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('=') {
            return Err(Error::config("invalid --rmenv option"));
        }
        self.ops.push(EnvOp::Rm {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn ops(&self) -> &[EnvOp] {
        &self.ops
    }

    // in accumulation order, so a later set wins over an earlier rm
    pub fn apply(&self) {
        for op in &self.ops {
            match op {
                EnvOp::Set { name, value } => std::env::set_var(name, value),
                EnvOp::Rm { name } => std::env::remove_var(name),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_requires_assignment() {
        let mut store = EnvStore::default();
        store.set("FOO=bar").unwrap();
        store.set("EMPTY=").unwrap();
        assert!(store.set("NOEQ").is_err());
        assert!(store.set("=val").is_err());
        assert_eq!(store.ops().len(), 2);
    }

    #[test]
    fn rm_rejects_assignment() {
        let mut store = EnvStore::default();
        store.rm("FOO").unwrap();
        assert!(store.rm("").is_err());
        assert!(store.rm("FOO=bar").is_err());
    }

    #[test]
    fn order_is_preserved() {
        let mut store = EnvStore::default();
        store.rm("FOO").unwrap();
        store.set("FOO=kept").unwrap();
        assert_eq!(
            store.ops().last(),
            Some(&EnvOp::Set {
                name: "FOO".into(),
                value: "kept".into()
            })
        );
    }
}
