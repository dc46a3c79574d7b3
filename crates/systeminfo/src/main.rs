use serde::Serialize;

#[derive(Serialize)]
struct Topology {
    online: Vec<usize>,
    nodes: Vec<systeminfo::Node>,
}

fn main() {
    let topology = systeminfo::online_cpus().and_then(|online| {
        Ok(Topology {
            online,
            nodes: systeminfo::numa_nodes()?,
        })
    });

    match topology {
        Ok(topology) => match serde_json::to_string_pretty(&topology) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("failed to serialize topology: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("failed to read topology: {e}");
            std::process::exit(1);
        }
    }
}
