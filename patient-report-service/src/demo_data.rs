use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::ingestion::{ContentIngestor, UploadSubmission};
use crate::models::DemoLoadResult;

const MAX_CONCURRENT_LOADS: usize = 4;

pub struct DemoDocument {
    pub title: &'static str,
    pub category: &'static str,
    pub content: &'static str,
}

/// Curated starter corpus for the knowledge base. Each entry runs
/// through the normal ingestion path, insights and chunking included.
pub fn demo_catalog() -> Vec<DemoDocument> {
    vec![
        DemoDocument {
            title: "Chest Pain Assessment",
            category: "cardiology",
            content: "Chest pain is a common symptom that can indicate coronary artery \
                disease, pulmonary embolism, pneumonia, gastroesophageal reflux, \
                musculoskeletal pain, or anxiety. Key assessment points: location, \
                radiation, character, duration, severity, and associated symptoms such as \
                shortness of breath, nausea or sweating. Red flags requiring immediate \
                attention: crushing substernal chest pain lasting more than 20 minutes, \
                chest pain with shortness of breath and sweating, pain radiating to the \
                left arm or jaw, and chest pain in patients with known cardiac disease.",
        },
        DemoDocument {
            title: "Dyspnea Evaluation",
            category: "pulmonology",
            content: "Shortness of breath assessment distinguishes acute from chronic \
                onset and whether it occurs at rest, on exertion, or positionally. Common \
                causes include asthma exacerbation, chronic obstructive pulmonary disease, \
                congestive heart failure, pulmonary embolism and pneumonia. Emergency \
                signs: severe respiratory distress, cyanosis, inability to speak in full \
                sentences, and altered mental status.",
        },
        DemoDocument {
            title: "Headache Classification",
            category: "neurology",
            content: "Primary headaches include migraine, tension and cluster types; \
                secondary headaches stem from underlying conditions. Migraine presents as \
                unilateral throbbing pain with nausea, photophobia and sometimes aura. \
                Tension headache is bilateral band-like pressure of mild to moderate \
                intensity. Emergency evaluation is needed for sudden severe onset, \
                headache with fever and neck stiffness, or focal neurological signs.",
        },
        DemoDocument {
            title: "Abdominal Pain by Location",
            category: "gastroenterology",
            content: "Abdominal pain assessment covers location, character, radiation, \
                timing relative to meals, and associated symptoms. Epigastric pain \
                suggests gastritis, reflux, pancreatitis or myocardial infarction; right \
                upper quadrant pain suggests cholecystitis or hepatitis; right lower \
                quadrant pain with fever and nausea raises concern for appendicitis, a \
                surgical emergency.",
        },
        DemoDocument {
            title: "Hypertension Management",
            category: "cardiology",
            content: "Hypertension management combines lifestyle modification with \
                stepped medication therapy. Patients should limit sodium, maintain \
                regular exercise, and monitor home blood pressure readings. Treatment \
                targets are individualized; persistent readings above 140/90 warrant \
                therapy review. Uncontrolled hypertension raises the risk of stroke, \
                cardiac disease and kidney damage.",
        },
        DemoDocument {
            title: "Type 2 Diabetes Monitoring",
            category: "endocrinology",
            content: "Type 2 diabetes monitoring centers on HbA1c, typically targeting \
                below 7 percent for most adults. Metformin remains first-line medication \
                alongside diet and exercise. Patients should receive annual retinal \
                screening, foot examination and kidney function testing. Hypoglycemia \
                symptoms include sweating, tremor and confusion.",
        },
        DemoDocument {
            title: "Pediatric Fever Guidance",
            category: "pediatrics",
            content: "Pediatric fever in a well-appearing child with good oral intake is \
                usually viral and managed with supportive care. Red flags include age \
                under three months with fever above 38C, lethargy, poor feeding, \
                petechial rash, and fever beyond five days. Immunization status changes \
                the risk assessment for serious bacterial infection.",
        },
        DemoDocument {
            title: "Geriatric Polypharmacy",
            category: "geriatrics",
            content: "Geriatric assessment considers polypharmacy, falls risk, cognition \
                and functional status. Multiple medications raise interaction risk; \
                dosing should start low and go slow given reduced renal and hepatic \
                function. Delirium is often medication-induced and reversible; dementia \
                is a chronic decline. Annual review should cover immunizations, \
                osteoporosis screening and hearing or vision assessment.",
        },
    ]
}

/// Run the fixed catalog through the ingestion pipeline with bounded
/// parallelism, continuing past individual failures.
pub async fn load_demo_data(ingestor: Arc<ContentIngestor>) -> DemoLoadResult {
    let catalog = demo_catalog();
    let total_documents = catalog.len();
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_LOADS));
    let mut join_set = JoinSet::new();

    for doc in catalog {
        let ingestor = ingestor.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return Err(care_flow::FlowError::Storage(
                    "demo loader semaphore closed".to_string(),
                ));
            };
            let submission = UploadSubmission {
                title: doc.title.to_string(),
                content: doc.content.to_string(),
                content_type: Some("plaintext".to_string()),
                filename: None,
                category: doc.category.to_string(),
                tags: vec!["demo_data".to_string()],
                source: "demo_data".to_string(),
            };
            let category = doc.category.to_string();
            match ingestor.accept(submission).await {
                Ok(_) => {
                    info!(title = doc.title, "demo document loaded");
                    Ok(category)
                }
                Err(e) => {
                    warn!(title = doc.title, error = %e, "demo document failed");
                    Err(e)
                }
            }
        });
    }

    let mut successful_loads = 0;
    let mut categories: BTreeSet<String> = BTreeSet::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(category)) => {
                successful_loads += 1;
                categories.insert(category);
            }
            Ok(Err(_)) => {}
            Err(e) => warn!(error = %e, "demo load task panicked"),
        }
    }

    DemoLoadResult {
        total_documents,
        successful_loads,
        failed_loads: total_documents - successful_loads,
        categories_loaded: categories.into_iter().collect(),
    }
}
