use kube::CustomResourceExt;
use member_operator::resources::nstemplatesets::NSTemplateSet;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&NSTemplateSet::crd())?);
    Ok(())
}
