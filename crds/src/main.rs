// Copyright (c) The NotebookValidator Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use kube::CustomResourceExt;
use nbv_crds::NotebookValidationJob;

const CRD_FILENAME: &str = "notebookvalidationjob.yaml";

/// Generate the NotebookValidationJob custom resource definition.
///
/// Pipe the output into kubectl to install it:
/// `nbv-crdgen | kubectl apply -f -`
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to write the definition into instead of printing it.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let definition = match serde_yaml::to_string(&NotebookValidationJob::crd()) {
        Ok(definition) => definition,
        Err(err) => {
            eprintln!("Couldn't render the definition: {}", err);
            exit(1);
        }
    };

    match &args.output {
        Some(dir) => {
            if !dir.is_dir() {
                eprintln!("The given output path is not a directory: {}", dir.display());
                exit(1);
            }
            let path = dir.join(CRD_FILENAME);
            if let Err(err) = fs::write(&path, &definition) {
                eprintln!("Couldn't write to {}: {}", path.display(), err);
                exit(1);
            }
        }
        None => println!("{definition}"),
    }
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;
    use nbv_crds::NotebookValidationJob;

    #[test]
    fn test_crd_identity() {
        let crd = NotebookValidationJob::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("notebookvalidationjobs.mlops.nbvalidator.dev"));
        assert_eq!(crd.spec.group, "mlops.nbvalidator.dev");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    }

    #[test]
    fn test_crd_renders_as_yaml() {
        let definition = serde_yaml::to_string(&NotebookValidationJob::crd()).unwrap();
        assert!(definition.contains("kind: CustomResourceDefinition"));
        assert!(definition.contains("notebookvalidationjobs.mlops.nbvalidator.dev"));
    }
}
