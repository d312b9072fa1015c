use kube::CustomResourceExt;
use kuryr_k8s::crd::{KuryrLoadBalancer, KuryrNetwork, KuryrNetworkPolicy};

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        KuryrNetworkPolicy::crd(),
        KuryrLoadBalancer::crd(),
        KuryrNetwork::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
