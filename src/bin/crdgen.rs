//! Print the EMQX CustomResourceDefinition as YAML
//!
//! `cargo run --bin crdgen | kubectl apply -f -`

use kube::CustomResourceExt;
use emqx_k8s::crd::Emqx;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Emqx::crd())?);
    Ok(())
}
