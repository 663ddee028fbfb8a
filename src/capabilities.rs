use crate::types::UI;
use dicom::dictionary_std::uids;

/// Storage SOP classes accepted by this receiver, in registration order.
/// The pairs are (keyword, UID) as listed in PS3.6 Annex A.
const STORAGE_SOP_CLASSES: &[(&str, &str)] = &[
	("CTImageStorage", "1.2.840.10008.5.1.4.1.1.2"),
	("MRImageStorage", "1.2.840.10008.5.1.4.1.1.4"),
	("PositronEmissionTomographyImageStorage", "1.2.840.10008.5.1.4.1.1.128"),
	("RTImageStorage", "1.2.840.10008.5.1.4.1.1.481.1"),
	("RTDoseStorage", "1.2.840.10008.5.1.4.1.1.481.2"),
	("RTStructureSetStorage", "1.2.840.10008.5.1.4.1.1.481.3"),
	("RTPlanStorage", "1.2.840.10008.5.1.4.1.1.481.5"),
	("SecondaryCaptureImageStorage", "1.2.840.10008.5.1.4.1.1.7"),
	("DigitalXRayImageStorageForPresentation", "1.2.840.10008.5.1.4.1.1.1.1"),
	("DigitalXRayImageStorageForProcessing", "1.2.840.10008.5.1.4.1.1.1.1.1"),
	("DigitalMammographyXRayImageStorageForPresentation", "1.2.840.10008.5.1.4.1.1.1.2"),
	("DigitalMammographyXRayImageStorageForProcessing", "1.2.840.10008.5.1.4.1.1.1.2.1"),
	("DigitalIntraOralXRayImageStorageForPresentation", "1.2.840.10008.5.1.4.1.1.1.3"),
	("DigitalIntraOralXRayImageStorageForProcessing", "1.2.840.10008.5.1.4.1.1.1.3.1"),
	("EnhancedSRStorage", "1.2.840.10008.5.1.4.1.1.88.22"),
	("ComprehensiveSRStorage", "1.2.840.10008.5.1.4.1.1.88.33"),
	("BasicTextSRStorage", "1.2.840.10008.5.1.4.1.1.88.11"),
	("XRayAngiographicImageStorage", "1.2.840.10008.5.1.4.1.1.12.1"),
	("XRayRadiofluoroscopicImageStorage", "1.2.840.10008.5.1.4.1.1.12.2"),
	("NuclearMedicineImageStorage", "1.2.840.10008.5.1.4.1.1.20"),
	("UltrasoundImageStorage", "1.2.840.10008.5.1.4.1.1.6.1"),
	("VLPhotographicImageStorage", "1.2.840.10008.5.1.4.1.1.77.1.4"),
	("VLEndoscopicImageStorage", "1.2.840.10008.5.1.4.1.1.77.1.1"),
	("VLMicroscopicImageStorage", "1.2.840.10008.5.1.4.1.1.77.1.2"),
	("VLSlideCoordinatesMicroscopicImageStorage", "1.2.840.10008.5.1.4.1.1.77.1.3"),
	("EnhancedPETImageStorage", "1.2.840.10008.5.1.4.1.1.130"),
	("EnhancedCTImageStorage", "1.2.840.10008.5.1.4.1.1.2.1"),
	("EnhancedMRImageStorage", "1.2.840.10008.5.1.4.1.1.4.1"),
	("SegmentationStorage", "1.2.840.10008.5.1.4.1.1.66.4"),
	("SurfaceSegmentationStorage", "1.2.840.10008.5.1.4.1.1.66.5"),
	("ParametricMapStorage", "1.2.840.10008.5.1.4.1.1.30"),
	("EncapsulatedPDFStorage", uids::ENCAPSULATED_PDF_STORAGE),
	("EncapsulatedCDAStorage", "1.2.840.10008.5.1.4.1.1.104.2"),
];

/// A single abstract syntax the receiver declares during association negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
	pub keyword: &'static str,
	pub uid: &'static str,
}

/// The ordered, immutable set of abstract syntaxes announced to association requestors.
#[derive(Debug, Clone)]
pub struct Capabilities {
	entries: Vec<Capability>,
}

impl Capabilities {
	/// All supported storage SOP classes followed by the Verification SOP class.
	pub fn storage() -> Self {
		let entries = STORAGE_SOP_CLASSES
			.iter()
			.map(|&(keyword, uid)| Capability { keyword, uid })
			.chain(std::iter::once(Capability {
				keyword: "Verification",
				uid: uids::VERIFICATION,
			}))
			.collect();

		Self { entries }
	}

	pub fn iter(&self) -> impl Iterator<Item = &Capability> {
		self.entries.iter()
	}

	/// The UIDs in registration order, as handed to the association acceptor.
	pub fn abstract_syntaxes(&self) -> Vec<UI> {
		self.entries.iter().map(|entry| UI::from(entry.uid)).collect()
	}
}
